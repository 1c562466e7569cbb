//! Card message texts and personalization
//!
//! A stored message is plain text. Personalization lifts it into a small
//! template language and renders it again:
//!
//! - `{count}` - number of trees the recipient receives
//! - `{recipient}` - how the card addresses the person the tree is for
//! - `{singular|plural}` - picked by `{count}`
//! - `{{` and `}}` - literal braces
//!
//! Unknown placeholders render as written.

use crate::models::event_types;

pub const DEFAULT_PRIMARY: &str = "We are immensely delighted to share that a tree has been planted in your name at the 14 Trees Foundation, Pune. This tree will be nurtured in your honour, rejuvenating ecosystems, supporting biodiversity, and helping offset the harmful effects of climate change.";

pub const DEFAULT_BIRTHDAY: &str = "We are immensely delighted to share that a tree has been planted in your name on the occasion of your birthday at the 14 Trees Foundation, Pune. This tree will be nurtured in your honour, helping offset the harmful effects of climate change.";

pub const DEFAULT_MEMORIAL: &str = "A tree has been planted in the memory of <name here> at the 14 Trees Foundation reforestation site. For many years, this tree will help rejuvenate local ecosystems, support local biodiversity and offset the harmful effects of climate change and global warming.";

pub const DEFAULT_SECONDARY: &str = "We invite you to visit 14 Trees and firsthand experience the growth and contribution of your tree towards a greener future.";

pub const DEFAULT_LOGO: &str = "Gifted by 14 Trees in partnership with";

/// Marker in memorial messages replaced by the remembered person
pub const MEMORIAL_NAME_MARKER: &str = "<name here>";

/// Default primary message for an event type
pub fn default_primary_for(event_type: Option<&str>) -> &'static str {
    match event_type {
        Some(event_types::BIRTHDAY) => DEFAULT_BIRTHDAY,
        Some(event_types::MEMORIAL) => DEFAULT_MEMORIAL,
        _ => DEFAULT_PRIMARY,
    }
}

/// How often a singular phrase is lifted into a template fragment
#[derive(Clone, Copy)]
enum Occurrence {
    First,
    All,
}

/// Singular phrases and the template fragment that replaces them, applied in order
const PLURAL_RULES: &[(&str, &str, Occurrence)] = &[
    ("a tree", "{count} {tree|trees}", Occurrence::First),
    ("A tree", "{count} {tree|trees}", Occurrence::First),
    ("This tree", "{This tree|These trees}", Occurrence::All),
    ("this tree", "{this tree|these trees}", Occurrence::All),
    (" tree has ", " {tree has|trees have} ", Occurrence::All),
    (" tree ", " {tree|trees} ", Occurrence::All),
    ("{tree|trees} has ", "{tree|trees} {has|have} ", Occurrence::All),
];

/// The person a card speaks about when it differs from the recipient
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Addressee<'a> {
    pub name: &'a str,
    /// Relation of the person to the recipient, e.g. "Brother"
    pub relation: Option<&'a str>,
}

impl Addressee<'_> {
    fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    fn relation(&self) -> Option<String> {
        self.relation
            .map(str::trim)
            .filter(|relation| !relation.is_empty() && !relation.eq_ignore_ascii_case("other"))
            .map(str::to_lowercase)
    }
}

/// Inputs for personalizing one card's message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Personalization<'a> {
    pub event_type: Option<&'a str>,
    pub addressee: Option<Addressee<'a>>,
    /// Trees the recipient/assignee pair receives
    pub tree_count: usize,
}

/// Variables available while rendering a template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageVars {
    pub count: usize,
    pub recipient: Option<String>,
}

fn escape(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

fn replace_first(text: &str, from: &str, to: &str) -> String {
    match text.find(from) {
        Some(index) => format!("{}{}{}", &text[..index], to, &text[index + from.len()..]),
        None => text.to_string(),
    }
}

/// Lift the singular tree wording of `message` into count-aware fragments
pub fn pluralizable(message: &str) -> String {
    PLURAL_RULES
        .iter()
        .fold(message.to_string(), |template, (from, to, occurrence)| match occurrence {
            Occurrence::First => replace_first(&template, from, to),
            Occurrence::All => template.replace(from, to),
        })
}

/// Insert the `{recipient}` placeholder where the message names its reader
fn addressable(message: &str, event_type: Option<&str>) -> String {
    if event_type == Some(event_types::MEMORIAL) {
        replace_first(message, MEMORIAL_NAME_MARKER, "{recipient}")
    } else {
        replace_first(message, "your", "{recipient}'s")
    }
}

/// Render a template with `vars`
pub fn render(template: &str, vars: &MessageVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(index) = rest.find(['{', '}']) {
        out.push_str(&rest[..index]);
        let tail = &rest[index..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        let Some(close) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        let name = &tail[1..close];
        match name {
            "count" => out.push_str(&vars.count.to_string()),
            "recipient" => match vars.recipient {
                Some(ref recipient) => out.push_str(recipient),
                None => out.push_str(&tail[..=close]),
            },
            _ => match name.split_once('|') {
                Some((singular, plural)) => out.push_str(if vars.count == 1 { singular } else { plural }),
                None => out.push_str(&tail[..=close]),
            },
        }
        rest = &tail[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Personalize a stored message for one card.
///
/// The message names the addressee (with their relation, when known) and
/// switches to plural wording when the pair receives more than one tree.
/// Without either, the message is returned unchanged.
pub fn personalize(message: &str, personalization: &Personalization<'_>) -> String {
    let plural = personalization.tree_count > 1;
    if personalization.addressee.is_none() && !plural {
        return message.to_string();
    }

    let mut template = escape(message);
    let mut vars = MessageVars {
        count: personalization.tree_count.max(1),
        recipient: None,
    };

    if let Some(addressee) = personalization.addressee {
        template = addressable(&template, personalization.event_type);
        let first_name = addressee.first_name();
        vars.recipient = Some(match addressee.relation() {
            Some(relation) => format!("your {} {}", relation, first_name),
            None => first_name.to_string(),
        });
    }
    if plural {
        template = pluralizable(&template);
    }

    render(&template, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn for_count(count: usize) -> Personalization<'static> {
        Personalization {
            event_type: None,
            addressee: None,
            tree_count: count,
        }
    }

    #[test]
    fn test_single_tree_keeps_message() {
        assert_eq!(personalize(DEFAULT_PRIMARY, &for_count(1)), DEFAULT_PRIMARY);
    }

    #[test]
    fn test_plural_primary_message() {
        let message = personalize(DEFAULT_PRIMARY, &for_count(3));
        assert!(message.starts_with(
            "We are immensely delighted to share that 3 trees have been planted in your name"
        ));
        assert!(message.contains("These trees will be nurtured in your honour"));
    }

    #[test]
    fn test_plural_memorial_message() {
        let message = personalize(DEFAULT_MEMORIAL, &for_count(2));
        assert!(message.starts_with("2 trees have been planted in the memory of <name here>"));
        assert!(message.contains("For many years, these trees will help"));
    }

    #[test]
    fn test_addressee_replaces_first_your() {
        let personalization = Personalization {
            event_type: None,
            addressee: Some(Addressee {
                name: "Ravi Kumar",
                relation: None,
            }),
            tree_count: 1,
        };
        let message = personalize(DEFAULT_PRIMARY, &personalization);
        assert!(message.contains("planted in Ravi's name"));
        // only the first occurrence
        assert!(message.contains("in your honour"));
    }

    #[test]
    fn test_addressee_with_relation() {
        let personalization = Personalization {
            event_type: None,
            addressee: Some(Addressee {
                name: "Ravi Kumar",
                relation: Some("Brother"),
            }),
            tree_count: 2,
        };
        let message = personalize(DEFAULT_PRIMARY, &personalization);
        assert!(message.contains("2 trees have been planted in your brother Ravi's name"));
    }

    #[test]
    fn test_other_relation_is_ignored() {
        let personalization = Personalization {
            event_type: Some(event_types::MEMORIAL),
            addressee: Some(Addressee {
                name: "Meera",
                relation: Some("other"),
            }),
            tree_count: 1,
        };
        let message = personalize(DEFAULT_MEMORIAL, &personalization);
        assert!(message.starts_with("A tree has been planted in the memory of Meera at"));
    }

    #[test]
    fn test_memorial_with_relation() {
        let personalization = Personalization {
            event_type: Some(event_types::MEMORIAL),
            addressee: Some(Addressee {
                name: "Meera Joshi",
                relation: Some("Grandmother"),
            }),
            tree_count: 1,
        };
        let message = personalize(DEFAULT_MEMORIAL, &personalization);
        assert!(message.contains("in the memory of your grandmother Meera at"));
    }

    #[test]
    fn test_literal_braces_survive() {
        let message = personalize("Happy {day}! Enjoy a tree.", &for_count(2));
        assert_eq!(message, "Happy {day}! Enjoy 2 trees.");
    }

    #[test]
    fn test_render_template_variables() {
        let vars = MessageVars {
            count: 1,
            recipient: None,
        };
        assert_eq!(render("{count} {tree|trees} for {recipient}", &vars), "1 tree for {recipient}");
        assert_eq!(render("unclosed {count", &vars), "unclosed {count");
    }

    #[test]
    fn test_default_primary_for_event() {
        assert_eq!(default_primary_for(Some("1")), DEFAULT_BIRTHDAY);
        assert_eq!(default_primary_for(Some("2")), DEFAULT_MEMORIAL);
        assert_eq!(default_primary_for(None), DEFAULT_PRIMARY);
    }
}
