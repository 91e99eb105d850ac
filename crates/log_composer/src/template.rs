//! Parsing and rendering of output templates and message templates.
//!
//! Templates are plain text with `{Name}` placeholders. A placeholder may carry an alignment
//! and a format, as in `{Level,-5:u3}` or `{Timestamp:HH:mm:ss}`. Literal braces are written
//! as `{{` and `}}`.

use std::{collections::BTreeSet, fmt::Display};

use serde_json::Value;
use time::OffsetDateTime;

use crate::event::LogEvent;

/// Placeholder names with a built-in meaning in output templates.
pub(crate) mod names {
    pub(crate) const TIMESTAMP: &str = "Timestamp";
    pub(crate) const LEVEL: &str = "Level";
    pub(crate) const MESSAGE: &str = "Message";
    pub(crate) const MESSAGE_TEMPLATE: &str = "MessageTemplate";
    pub(crate) const EXCEPTION: &str = "Exception";
    pub(crate) const NEW_LINE: &str = "NewLine";
    pub(crate) const PROPERTIES: &str = "Properties";
}

/// Template head shared by every pipeline: timestamp, level, message and the static and
/// correlation fields. Enrichment fragments are appended after it.
pub const DEFAULT_PREFIX: &str = "[{Timestamp:HH:mm:ss} {Level:u3}] {Message:lj} \
     (Application: {Application},ApplicationInstance:{ApplicationInstance}, \
     CorrelationId: {CorrelationId},";

/// Template tail closing every pipeline template.
pub const DEFAULT_SUFFIX: &str = "{Exception}{NewLine})";

/// Timestamp format used when a `{Timestamp}` placeholder has no explicit format.
pub(crate) const DEFAULT_TIMESTAMP_FORMAT: &str = "yyyy-MM-dd HH:mm:ss.fff zzz";

/// Errors raised while parsing a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A `{` was not closed by a matching `}`.
    #[error("unterminated placeholder starting at byte {position}")]
    UnterminatedPlaceholder {
        /// Byte offset of the opening brace.
        position: usize,
    },

    /// A `}` appeared outside a placeholder without being doubled.
    #[error("unexpected `}}` at byte {position}")]
    UnexpectedClosingBrace {
        /// Byte offset of the closing brace.
        position: usize,
    },

    /// The placeholder name is empty or contains characters other than letters, digits and `_`.
    #[error("invalid placeholder name `{name}`")]
    InvalidPropertyName {
        /// The offending name.
        name: String,
    },

    /// The alignment part of a placeholder is not an integer.
    #[error("invalid alignment `{alignment}` in placeholder `{placeholder}`")]
    InvalidAlignment {
        /// The offending alignment text.
        alignment: String,

        /// The full placeholder text.
        placeholder: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Property(PropertyToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PropertyToken {
    name: String,
    alignment: Option<i32>,
    format: Option<String>,
    raw: String,
}

impl PropertyToken {
    fn parse(content: &str) -> Result<Self, TemplateError> {
        let raw = format!("{{{content}}}");
        let (head, format) = match content.split_once(':') {
            Some((head, format)) => (head, Some(format.to_string())),
            None => (content, None),
        };
        let (name, alignment) = match head.split_once(',') {
            Some((name, alignment)) => {
                let parsed = alignment.trim().parse::<i32>().map_err(|_| {
                    TemplateError::InvalidAlignment {
                        alignment: alignment.to_string(),
                        placeholder: raw.clone(),
                    }
                })?;
                (name, Some(parsed))
            }
            None => (head, None),
        };

        // `@` and `$` are capturing hints; they do not change the property name.
        let name = name.trim_start_matches(['@', '$']);
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(TemplateError::InvalidPropertyName {
                name: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            alignment,
            format,
            raw,
        })
    }

    fn pad(&self, rendered: String) -> String {
        let Some(alignment) = self.alignment else {
            return rendered;
        };
        let width = usize::try_from(alignment.unsigned_abs()).unwrap_or(0);
        if alignment < 0 {
            format!("{rendered:<width$}")
        } else {
            format!("{rendered:>width$}")
        }
    }
}

/// A parsed, immutable output template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    text: String,
    tokens: Vec<Token>,
    property_names: BTreeSet<String>,
}

impl OutputTemplate {
    /// Parses `text` into a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] if the text is not a well-formed template.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(text)?;
        let property_names = tokens
            .iter()
            .filter_map(|token| match token {
                Token::Property(property) => Some(property.name.clone()),
                Token::Text(_) => None,
            })
            .collect();

        Ok(Self {
            text: text.to_string(),
            tokens,
            property_names,
        })
    }

    /// The template text this template was parsed from.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the template contains a placeholder named `name`.
    pub fn references(&self, name: &str) -> bool {
        self.property_names.contains(name)
    }

    /// Renders `event` into a single line of text.
    pub fn render(&self, event: &LogEvent) -> String {
        let mut output = String::with_capacity(self.text.len() + event.message.len());
        for token in &self.tokens {
            match token {
                Token::Text(text) => output.push_str(text),
                Token::Property(property) => {
                    output.push_str(&property.pad(self.render_property(property, event)));
                }
            }
        }
        output
    }

    fn render_property(&self, property: &PropertyToken, event: &LogEvent) -> String {
        let format = property.format.as_deref();
        match property.name.as_str() {
            names::TIMESTAMP => {
                format_timestamp(&event.timestamp, format.unwrap_or(DEFAULT_TIMESTAMP_FORMAT))
            }
            names::LEVEL => event.level.render(format),
            names::MESSAGE => event.message.clone(),
            names::MESSAGE_TEMPLATE => event
                .message_template
                .clone()
                .unwrap_or_else(|| event.message.clone()),
            names::EXCEPTION => event
                .exception
                .as_ref()
                .map(|exception| format!("{}\n", exception.render_text()))
                .unwrap_or_default(),
            names::NEW_LINE => "\n".to_string(),
            names::PROPERTIES => {
                let remaining = event
                    .properties
                    .iter()
                    .filter(|(name, _)| !self.property_names.contains(name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<serde_json::Map<_, _>>();
                Value::Object(remaining).to_string()
            }
            name => event
                .properties
                .get(name)
                .map(|value| render_value(value, format))
                .unwrap_or_default(),
        }
    }
}

impl Display for OutputTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = text.char_indices().peekable();

    while let Some((position, c)) = chars.next() {
        match c {
            '{' if chars.peek().is_some_and(|(_, next)| *next == '{') => {
                chars.next();
                literal.push('{');
            }
            '{' => {
                let rest = text.get(position + 1..).unwrap_or_default();
                let end = rest
                    .find(['}', '{'])
                    .filter(|end| rest.get(*end..).is_some_and(|tail| tail.starts_with('}')))
                    .ok_or(TemplateError::UnterminatedPlaceholder { position })?;
                let content = rest.get(..end).unwrap_or_default();
                let property = PropertyToken::parse(content)?;

                if !literal.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Property(property));

                // Skip the placeholder body and its closing brace.
                for _ in 0..=content.chars().count() {
                    chars.next();
                }
            }
            '}' if chars.peek().is_some_and(|(_, next)| *next == '}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(TemplateError::UnexpectedClosingBrace { position }),
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Text(literal));
    }
    Ok(tokens)
}

/// Renders a property value: strings are written verbatim unless the `j` format asks for JSON,
/// everything else is written as JSON.
fn render_value(value: &Value, format: Option<&str>) -> String {
    match value {
        Value::String(s) if format != Some("j") => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a message template, filling placeholders with `values` in order of appearance.
///
/// Placeholders without a matching value, and templates that fail to parse, are left as
/// written.
pub(crate) fn render_message(template: &str, values: &[&dyn Display]) -> String {
    let Ok(tokens) = tokenize(template) else {
        return template.to_string();
    };

    let mut values = values.iter();
    let mut output = String::with_capacity(template.len());
    for token in tokens {
        match token {
            Token::Text(text) => output.push_str(&text),
            Token::Property(property) => match values.next() {
                Some(value) => output.push_str(&property.pad(value.to_string())),
                None => output.push_str(&property.raw),
            },
        }
    }
    output
}

/// Formats `timestamp` with a .NET-style custom date and time format string.
///
/// Supported specifiers are `y`, `M`, `d`, `H`, `h`, `m`, `s`, `f`, `z` and `t` in their usual
/// repetitions; a backslash escapes the next character and `'…'` quotes literal text.
pub(crate) fn format_timestamp(timestamp: &OffsetDateTime, format: &str) -> String {
    let mut output = String::with_capacity(format.len() + 8);
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        let mut count = 1usize;
        if matches!(c, 'y' | 'M' | 'd' | 'H' | 'h' | 'm' | 's' | 'f' | 'z' | 't') {
            while chars.peek() == Some(&c) {
                chars.next();
                count += 1;
            }
        }

        match (c, count) {
            ('y', 1) => output.push_str(&timestamp.year().rem_euclid(100).to_string()),
            ('y', 2) => output.push_str(&format!("{:02}", timestamp.year().rem_euclid(100))),
            ('y', n) => output.push_str(&format!("{:0n$}", timestamp.year())),
            ('M', 1) => output.push_str(&u8::from(timestamp.month()).to_string()),
            ('M', 2) => output.push_str(&format!("{:02}", u8::from(timestamp.month()))),
            ('M', 3) => output.extend(timestamp.month().to_string().chars().take(3)),
            ('M', _) => output.push_str(&timestamp.month().to_string()),
            ('d', 1) => output.push_str(&timestamp.day().to_string()),
            ('d', 2) => output.push_str(&format!("{:02}", timestamp.day())),
            ('d', 3) => output.extend(timestamp.weekday().to_string().chars().take(3)),
            ('d', _) => output.push_str(&timestamp.weekday().to_string()),
            ('H', 1) => output.push_str(&timestamp.hour().to_string()),
            ('H', _) => output.push_str(&format!("{:02}", timestamp.hour())),
            ('h', n) => {
                let hour = match timestamp.hour() % 12 {
                    0 => 12,
                    hour => hour,
                };
                if n == 1 {
                    output.push_str(&hour.to_string());
                } else {
                    output.push_str(&format!("{hour:02}"));
                }
            }
            ('m', 1) => output.push_str(&timestamp.minute().to_string()),
            ('m', _) => output.push_str(&format!("{:02}", timestamp.minute())),
            ('s', 1) => output.push_str(&timestamp.second().to_string()),
            ('s', _) => output.push_str(&format!("{:02}", timestamp.second())),
            ('f', n) => {
                let digits = format!("{:09}", timestamp.nanosecond());
                output.push_str(digits.get(..n.min(9)).unwrap_or_default());
            }
            ('z', n) => {
                let offset = timestamp.offset();
                let sign = if offset.is_negative() { '-' } else { '+' };
                let hours = offset.whole_hours().unsigned_abs();
                match n {
                    1 => output.push_str(&format!("{sign}{hours}")),
                    2 => output.push_str(&format!("{sign}{hours:02}")),
                    _ => output.push_str(&format!(
                        "{sign}{hours:02}:{:02}",
                        offset.minutes_past_hour().unsigned_abs()
                    )),
                }
            }
            ('t', n) => {
                let designator = if timestamp.hour() < 12 { "AM" } else { "PM" };
                output.push_str(designator.get(..n.min(2)).unwrap_or_default());
            }
            ('\\', _) => {
                if let Some(escaped) = chars.next() {
                    output.push(escaped);
                }
            }
            ('\'', _) => {
                for quoted in chars.by_ref() {
                    if quoted == '\'' {
                        break;
                    }
                    output.push(quoted);
                }
            }
            (other, _) => output.push(other),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::{event::ExceptionInfo, level::LogLevel};

    fn event() -> LogEvent {
        LogEvent {
            timestamp: datetime!(2024-03-05 14:07:09.123456 +02:00),
            level: LogLevel::Information,
            message_template: Some("User {UserId} signed in".to_string()),
            message: "User 42 signed in".to_string(),
            exception: None,
            properties: BTreeMap::from([
                ("Application".to_string(), json!("billing")),
                ("ApplicationInstance".to_string(), json!(3)),
                ("UserId".to_string(), json!(42)),
            ]),
        }
    }

    #[test]
    fn renders_default_prefix_and_suffix() {
        let template = OutputTemplate::parse(&format!("{DEFAULT_PREFIX}{DEFAULT_SUFFIX}"))
            .expect("default template should parse");

        assert_eq!(
            template.render(&event()),
            "[14:07:09 INF] User 42 signed in (Application: billing,ApplicationInstance:3, \
             CorrelationId: ,\n)"
        );
    }

    #[test]
    fn missing_properties_render_empty_but_keep_alignment() {
        let template = OutputTemplate::parse("[{Missing,4}]").expect("template should parse");
        assert_eq!(template.render(&event()), "[    ]");
    }

    #[test]
    fn renders_exception_and_escaped_braces() {
        let mut event = event();
        event.exception = Some(ExceptionInfo {
            message: "connection reset".to_string(),
            sources: vec!["broken pipe".to_string()],
        });
        let template =
            OutputTemplate::parse("{{{Level,-5}}} {Exception}").expect("template should parse");

        assert_eq!(
            template.render(&event),
            "{Information} connection reset\n  Caused by: broken pipe\n"
        );
    }

    #[test]
    fn properties_token_lists_only_unreferenced_properties() {
        let template =
            OutputTemplate::parse("{Application} {Properties}").expect("template should parse");
        assert_eq!(
            template.render(&event()),
            r#"billing {"ApplicationInstance":3,"UserId":42}"#
        );
    }

    #[test]
    fn rejects_malformed_templates() {
        assert_eq!(
            OutputTemplate::parse("[{Level"),
            Err(TemplateError::UnterminatedPlaceholder { position: 1 })
        );
        assert_eq!(
            OutputTemplate::parse("oops }"),
            Err(TemplateError::UnexpectedClosingBrace { position: 5 })
        );
        assert!(matches!(
            OutputTemplate::parse("{}"),
            Err(TemplateError::InvalidPropertyName { .. })
        ));
        assert!(matches!(
            OutputTemplate::parse("{Level,wide}"),
            Err(TemplateError::InvalidAlignment { .. })
        ));
        assert!(matches!(
            OutputTemplate::parse("{Le{vel}"),
            Err(TemplateError::UnterminatedPlaceholder { .. })
        ));
    }

    #[test]
    fn formats_dotnet_style_timestamps() {
        let timestamp = datetime!(2024-03-05 14:07:09.123456 +02:00);

        assert_eq!(
            format_timestamp(&timestamp, DEFAULT_TIMESTAMP_FORMAT),
            "2024-03-05 14:07:09.123 +02:00"
        );
        assert_eq!(format_timestamp(&timestamp, "yyyy.MM.dd"), "2024.03.05");
        assert_eq!(format_timestamp(&timestamp, "h:mm tt"), "2:07 PM");
        assert_eq!(format_timestamp(&timestamp, "ddd, MMM d"), "Tue, Mar 5");
        assert_eq!(format_timestamp(&timestamp, "'day' d"), "day 5");
    }

    #[test]
    fn message_templates_fill_values_positionally() {
        let user = 7;
        let action = "logout";
        assert_eq!(
            render_message("User {UserId} did {Action} at {Time}", &[&user, &action]),
            "User 7 did logout at {Time}"
        );
        assert_eq!(render_message("broken {", &[&user]), "broken {");
    }
}
