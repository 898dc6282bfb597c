//! The theme taxonomy the labeler constrains the model to. Embedded for
//! now; `taxonomy_ref` on the label payload is reserved for loading an
//! external file.

use serde_json::{json, Value};

pub struct Theme {
    pub name: &'static str,
    pub description: &'static str,
}

/// Theme applied when the model's answer matches nothing in the taxonomy.
pub const FALLBACK_THEME: &str = "General Feedback";

pub static TAXONOMY: &[Theme] = &[
    Theme {
        name: "Account & Login",
        description: "Sign-in, registration, password reset, session handling and account recovery.",
    },
    Theme {
        name: "Performance & Stability",
        description: "Crashes, freezes, slow loading, battery drain and general sluggishness.",
    },
    Theme {
        name: "Pricing & Subscription",
        description: "Cost complaints, billing problems, free-tier limits, refunds and cancellation.",
    },
    Theme {
        name: "User Interface",
        description: "Layout, navigation, readability, dark mode and visual design feedback.",
    },
    Theme {
        name: "Sync & Data",
        description: "Cross-device sync, data loss, import/export and backup behavior.",
    },
    Theme {
        name: "Notifications",
        description: "Push and email notifications: missing, excessive or badly timed.",
    },
    Theme {
        name: "Content Quality",
        description: "Accuracy, relevance and freshness of the content the app serves.",
    },
    Theme {
        name: "Customer Support",
        description: "Responsiveness and helpfulness of the support channels.",
    },
    Theme {
        name: "Feature Requests",
        description: "Explicit asks for new capabilities or changes to existing ones.",
    },
    Theme {
        name: "General Feedback",
        description: "Praise or criticism that fits no specific theme.",
    },
];

pub fn is_known_theme(name: &str) -> bool {
    TAXONOMY.iter().any(|theme| theme.name == name)
}

/// The taxonomy as the JSON array embedded into the labeling prompt.
pub fn taxonomy_json() -> Value {
    Value::Array(
        TAXONOMY
            .iter()
            .map(|theme| json!({ "name": theme.name, "description": theme.description }))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_theme_is_part_of_the_taxonomy() {
        assert!(is_known_theme(FALLBACK_THEME));
    }

    #[test]
    fn unknown_themes_are_rejected() {
        assert!(!is_known_theme("Astrology"));
        assert!(!is_known_theme("account & login"));
    }

    #[test]
    fn json_form_carries_names_and_descriptions() {
        let value = taxonomy_json();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), TAXONOMY.len());
        assert!(entries
            .iter()
            .all(|e| e["name"].is_string() && e["description"].is_string()));
    }
}
