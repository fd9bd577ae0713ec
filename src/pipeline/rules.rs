//! Regex line-item parser.
//!
//! Fast, model-free extraction of requested items from an RFQ email:
//! - `500 x M8 hex bolts`, `- 20 pcs copper pipe 15mm`
//! - `Steel plate 4mm - qty 12`, `Copper pipe: 30 m`
//!
//! Quoted reply lines (`> ...`) are skipped so earlier messages in the
//! thread are not counted twice. Senders matching an ignore rule (mailer
//! daemons, noreply addresses) yield no items.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::conversation::activities::ThreadParser;
use crate::conversation::outcome::LineItem;
use crate::store::traits::StoredMessage;

/// A pattern for one line-item layout. Must define `qty` and `desc`
/// groups and may define `unit`.
#[derive(Debug, Clone)]
pub struct LineRule {
    /// Human-readable layout name.
    pub name: String,
    pub regex: Regex,
}

/// Sender pattern whose messages never contain requests.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    pub regex: Regex,
    pub reason: String,
}

pub struct RulesParser {
    line_rules: Vec<LineRule>,
    ignore_rules: Vec<IgnoreRule>,
}

impl RulesParser {
    /// Parser with the default layouts and ignore rules.
    pub fn default_rules() -> Self {
        let line_rules = vec![
            // "500 x M8 bolts", "- 20 pcs of copper pipe"
            LineRule {
                name: "quantity first".into(),
                regex: Regex::new(
                    r"(?i)^\s*(?:[-*]\s*)?(?P<qty>\d{1,7})\s*(?P<unit>x|pcs|pieces|units|ea|kg|m)\b\.?\s+(?:of\s+)?(?P<desc>.+?)\s*$",
                )
                .unwrap(),
            },
            // "Steel plate 4mm - qty 12", "hex nuts, quantity: 300"
            LineRule {
                name: "quantity keyword".into(),
                regex: Regex::new(
                    r"(?i)^\s*(?:[-*]\s*)?(?P<desc>[^:]+?)\s*[:,-]\s*(?:qty|quantity)\.?:?\s*(?P<qty>\d{1,7})\s*(?P<unit>pcs|pieces|units|ea|kg|m)?\.?\s*$",
                )
                .unwrap(),
            },
            // "Copper pipe: 30 m"
            LineRule {
                name: "quantity last".into(),
                regex: Regex::new(
                    r"(?i)^\s*(?:[-*]\s*)?(?P<desc>[^:]+?)\s*[:-]\s*(?P<qty>\d{1,7})\s*(?P<unit>pcs|pieces|units|ea|kg|m)\.?\s*$",
                )
                .unwrap(),
            },
        ];

        let ignore_rules = vec![
            IgnoreRule {
                regex: Regex::new(r"(?i)^no[\-_.]?reply@").unwrap(),
                reason: "noreply sender".into(),
            },
            IgnoreRule {
                regex: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@").unwrap(),
                reason: "automated mail system".into(),
            },
        ];

        Self {
            line_rules,
            ignore_rules,
        }
    }

    /// Parser without rules (for testing).
    pub fn empty() -> Self {
        Self {
            line_rules: Vec::new(),
            ignore_rules: Vec::new(),
        }
    }

    /// Add a custom line layout. The pattern needs `qty` and `desc` groups.
    pub fn add_line_rule(&mut self, name: &str, pattern: &str) -> Result<(), regex::Error> {
        let regex = Regex::new(pattern)?;
        let names: Vec<_> = regex.capture_names().flatten().collect();
        if !names.contains(&"qty") || !names.contains(&"desc") {
            return Err(regex::Error::Syntax(format!(
                "line rule '{name}' must capture `qty` and `desc`"
            )));
        }
        self.line_rules.push(LineRule {
            name: name.into(),
            regex,
        });
        Ok(())
    }

    /// Add a sender pattern to ignore.
    pub fn add_ignore_rule(&mut self, pattern: &str, reason: &str) -> Result<(), regex::Error> {
        self.ignore_rules.push(IgnoreRule {
            regex: Regex::new(pattern)?,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Extract line items from a message body.
    pub fn extract(&self, sender: &str, content: &str) -> Vec<LineItem> {
        if let Some(rule) = self.ignore_rules.iter().find(|r| r.regex.is_match(sender)) {
            debug!(sender, reason = %rule.reason, "Sender matched ignore rule");
            return Vec::new();
        }

        content
            .lines()
            .filter(|line| !line.trim_start().starts_with('>'))
            .filter_map(|line| self.parse_line(line))
            .collect()
    }

    fn parse_line(&self, line: &str) -> Option<LineItem> {
        self.line_rules.iter().find_map(|rule| {
            let caps = rule.regex.captures(line)?;
            let quantity = caps.name("qty")?.as_str().parse().ok()?;
            if quantity == 0 {
                return None;
            }
            let description = caps.name("desc")?.as_str().trim().to_string();
            if description.is_empty() {
                return None;
            }
            let unit = caps
                .name("unit")
                .map(|u| u.as_str().to_lowercase())
                .filter(|u| u != "x")
                .map(|u| if u == "pieces" { "pcs".to_string() } else { u });
            debug!(rule = %rule.name, quantity, description = %description, "Line item matched");
            Some(LineItem {
                description,
                quantity,
                unit,
            })
        })
    }
}

#[async_trait]
impl ThreadParser for RulesParser {
    async fn parse(&self, thread: &[StoredMessage], message: &StoredMessage) -> anyhow::Result<Vec<LineItem>> {
        let items = self.extract(&message.sender, &message.content);
        debug!(
            message_id = %message.id,
            thread_len = thread.len(),
            items = items.len(),
            "Rules parser finished"
        );
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_first_lines() {
        let parser = RulesParser::default_rules();
        let items = parser.extract(
            "buyer@acme.test",
            "Hi,\n\nplease quote:\n- 500 x M8 hex bolts\n- 20 pcs of copper pipe 15mm\n\nThanks",
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].quantity, 500);
        assert_eq!(items[0].description, "M8 hex bolts");
        assert_eq!(items[0].unit, None);
        assert_eq!(items[1].quantity, 20);
        assert_eq!(items[1].unit.as_deref(), Some("pcs"));
        assert_eq!(items[1].description, "copper pipe 15mm");
    }

    #[test]
    fn quantity_keyword_and_trailing_quantity() {
        let parser = RulesParser::default_rules();
        let items = parser.extract(
            "buyer@acme.test",
            "Steel plate 4mm - qty 12\nCopper pipe: 30 m",
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "Steel plate 4mm");
        assert_eq!(items[0].quantity, 12);
        assert_eq!(items[1].description, "Copper pipe");
        assert_eq!(items[1].unit.as_deref(), Some("m"));
    }

    #[test]
    fn prose_and_references_are_not_items() {
        let parser = RulesParser::default_rules();
        let items = parser.extract(
            "buyer@acme.test",
            "Order ref: 12345\nCan you call me at 5?\nWe need bolts soon.",
        );
        assert!(items.is_empty());
    }

    #[test]
    fn quoted_lines_are_skipped() {
        let parser = RulesParser::default_rules();
        let items = parser.extract(
            "buyer@acme.test",
            "10 x washers\n\n> 500 x M8 hex bolts",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "washers");
    }

    #[test]
    fn ignored_senders_yield_nothing() {
        let parser = RulesParser::default_rules();
        assert!(parser.extract("noreply@shop.test", "5 x bolts").is_empty());
        assert!(parser.extract("MAILER-DAEMON@mx.test", "5 x bolts").is_empty());
    }

    #[test]
    fn custom_rules() {
        let mut parser = RulesParser::empty();
        assert!(parser.extract("a@b.test", "5 x bolts").is_empty());

        parser
            .add_line_rule("sku", r"^SKU (?P<desc>\S+) \* (?P<qty>\d+)$")
            .unwrap();
        let items = parser.extract("a@b.test", "SKU AB-12 * 40");
        assert_eq!(items[0].description, "AB-12");
        assert_eq!(items[0].quantity, 40);

        assert!(parser.add_line_rule("bad", r"^(\d+)$").is_err());

        parser.add_ignore_rule(r"@b\.test$", "test sender").unwrap();
        assert!(parser.extract("a@b.test", "SKU AB-12 * 40").is_empty());
    }
}
