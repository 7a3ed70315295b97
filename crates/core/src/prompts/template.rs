use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

pub type PromptArguments = HashMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::BuiltIn => None,
            Self::File(path) => Some(path.as_path()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    segments: Vec<TemplateSegment>,
    placeholders: BTreeSet<String>,
    source: PromptSource,
}

impl PromptTemplate {
    pub fn parse(key: impl Into<String>, template: impl Into<String>, source: PromptSource) -> Self {
        let template = template.into();
        let (segments, placeholders) = parse_template(&template);
        Self {
            key: key.into(),
            template,
            segments,
            placeholders,
            source,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(|s| s.as_str())
    }

    pub fn has_placeholder(&self, name: &str) -> bool {
        self.placeholders.contains(name)
    }

    /// Placeholders with no value in `arguments`.
    pub fn missing_arguments<'t>(&'t self, arguments: &PromptArguments) -> Vec<&'t str> {
        self.placeholders
            .iter()
            .filter(|name| !arguments.contains_key(name.as_str()))
            .map(|name| name.as_str())
            .collect()
    }

    /// Substitutes every placeholder; unknown ones render as empty text.
    pub fn render(&self, arguments: &PromptArguments) -> String {
        let mut output = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(name) => {
                    if let Some(value) = arguments.get(name) {
                        output.push_str(value);
                    }
                }
            }
        }
        output
    }
}

#[derive(Clone, Debug)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

fn parse_template(template: &str) -> (Vec<TemplateSegment>, BTreeSet<String>) {
    let mut segments = Vec::new();
    let mut placeholders = BTreeSet::new();
    let mut buffer = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some('{')) {
                    chars.next();
                    buffer.push('{');
                    continue;
                }

                let mut placeholder = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    placeholder.push(next);
                }

                let trimmed = placeholder.trim();
                if closed && is_identifier(trimmed) {
                    if !buffer.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut buffer)));
                    }
                    placeholders.insert(trimmed.to_string());
                    segments.push(TemplateSegment::Placeholder(trimmed.to_string()));
                } else {
                    buffer.push('{');
                    buffer.push_str(&placeholder);
                    if closed {
                        buffer.push('}');
                    }
                }
            }
            '}' => {
                if matches!(chars.peek(), Some('}')) {
                    chars.next();
                }
                buffer.push('}');
            }
            _ => buffer.push(ch),
        }
    }

    if !buffer.is_empty() {
        segments.push(TemplateSegment::Literal(buffer));
    }

    (segments, placeholders)
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_and_blanks_missing() {
        let template = PromptTemplate::parse("t", "主题：{topic}，类型：{genre}", PromptSource::BuiltIn);
        let args = PromptArguments::from([("topic".to_string(), "星海".to_string())]);
        assert_eq!(template.missing_arguments(&args), vec!["genre"]);
        assert_eq!(template.render(&args), "主题：星海，类型：");
    }

    #[test]
    fn keeps_escaped_and_non_identifier_braces() {
        let template = PromptTemplate::parse(
            "t",
            "{{literal}} {name} {不是占位符} {}",
            PromptSource::BuiltIn,
        );
        let args = PromptArguments::from([("name".to_string(), "林默".to_string())]);
        assert_eq!(template.render(&args), "{literal} 林默 {不是占位符} {}");
        assert_eq!(template.placeholders().collect::<Vec<_>>(), vec!["name"]);
    }
}
