//! Destination path templates
//!
//! Templates interpolate dataset fields with `{{ .Field }}` actions and
//! support one function, `{{ replace .Field "old" "new" }}`, which replaces
//! every occurrence of `old`. Templates are parsed once; unknown fields and
//! malformed actions are configuration errors.

use std::path::Path;
use std::sync::OnceLock;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

use crate::error::{IngestorError, Result};

/// Characters escaped in a single URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Values available to a destination template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFields {
    pub dataset_folder: String,
    pub source_folder: String,
    pub pid: String,
    pub pid_short: String,
    pub pid_prefix: String,
    pub pid_encoded: String,
    pub username: String,
}

impl TemplateFields {
    /// Derive all fields from the dataset folder, dataset pid and user name
    pub fn new(folder: &str, pid: &str, username: &str) -> Self {
        Self {
            dataset_folder: posix_base(folder),
            source_folder: folder.to_string(),
            pid: pid.to_string(),
            pid_short: posix_base(pid),
            pid_prefix: posix_dir(pid),
            pid_encoded: utf8_percent_encode(pid, PATH_SEGMENT).to_string(),
            username: username.to_string(),
        }
    }

    fn get(&self, field: Field) -> &str {
        match field {
            Field::DatasetFolder => &self.dataset_folder,
            Field::SourceFolder => &self.source_folder,
            Field::Pid => &self.pid,
            Field::PidShort => &self.pid_short,
            Field::PidPrefix => &self.pid_prefix,
            Field::PidEncoded => &self.pid_encoded,
            Field::Username => &self.username,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    DatasetFolder,
    SourceFolder,
    Pid,
    PidShort,
    PidPrefix,
    PidEncoded,
    Username,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "DatasetFolder" => Field::DatasetFolder,
            "SourceFolder" => Field::SourceFolder,
            "Pid" => Field::Pid,
            "PidShort" => Field::PidShort,
            "PidPrefix" => Field::PidPrefix,
            "PidEncoded" => Field::PidEncoded,
            "Username" => Field::Username,
            _ => return None,
        };
        Some(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
    Replace { field: Field, from: String, to: String },
}

/// A parsed destination template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTemplate {
    segments: Vec<Segment>,
}

fn action_regex() -> &'static Regex {
    static ACTION: OnceLock<Regex> = OnceLock::new();
    ACTION.get_or_init(|| {
        Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").unwrap_or_else(|e| unreachable!("invalid regex: {e}"))
    })
}

fn replace_regex() -> &'static Regex {
    static REPLACE: OnceLock<Regex> = OnceLock::new();
    REPLACE.get_or_init(|| {
        Regex::new(r#"^replace\s+\.(\w+)\s+"((?:[^"\\]|\\.)*)"\s+"((?:[^"\\]|\\.)*)"$"#)
            .unwrap_or_else(|e| unreachable!("invalid regex: {e}"))
    })
}

impl DestinationTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in action_regex().captures_iter(template) {
            let (Some(whole), Some(action)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            segments.push(parse_action(action.as_str())?);
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, fields: &TemplateFields) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(fields.get(*field)),
                Segment::Replace { field, from, to } => {
                    out.push_str(&fields.get(*field).replace(from.as_str(), to))
                }
            }
        }
        out
    }
}

fn parse_action(action: &str) -> Result<Segment> {
    if let Some(name) = action.strip_prefix('.') {
        return lookup(name).map(Segment::Field);
    }
    if let Some(caps) = replace_regex().captures(action) {
        let field = lookup(&caps[1])?;
        return Ok(Segment::Replace {
            field,
            from: unescape(&caps[2]),
            to: unescape(&caps[3]),
        });
    }
    Err(IngestorError::Config(format!(
        "unsupported destination template action: {{{{ {} }}}}",
        action
    )))
}

fn lookup(name: &str) -> Result<Field> {
    Field::parse(name).ok_or_else(|| {
        IngestorError::Config(format!("unknown destination template field: .{}", name))
    })
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Last element of a `/`-separated path, `"."` for an empty one
pub fn posix_base(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { ".".into() } else { "/".into() };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Everything but the last element of a `/`-separated path
pub fn posix_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".into(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".into(),
    }
}

/// Join `/`-separated path pieces without doubling separators
pub fn posix_join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            rest.trim_start_matches('/')
        ),
    }
}

/// Render a local path with `/` separators
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
        .replace("//", "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> TemplateFields {
        TemplateFields::new("/data/raw/run 42", "20.500.11935/abc-def", "alice")
    }

    #[test]
    fn test_derived_fields() {
        let f = fields();
        assert_eq!(f.dataset_folder, "run 42");
        assert_eq!(f.pid_short, "abc-def");
        assert_eq!(f.pid_prefix, "20.500.11935");
        assert_eq!(f.pid_encoded, "20.500.11935%2Fabc-def");
    }

    #[test]
    fn test_render_fields() {
        let t = DestinationTemplate::parse("/archive/{{ .Username }}/{{.PidShort}}/{{ .DatasetFolder }}")
            .unwrap();
        assert_eq!(t.render(&fields()), "/archive/alice/abc-def/run 42");
    }

    #[test]
    fn test_render_replace() {
        let t = DestinationTemplate::parse(r#"/archive/{{ replace .Pid "/" "_" }}"#).unwrap();
        assert_eq!(t.render(&fields()), "/archive/20.500.11935_abc-def");
    }

    #[test]
    fn test_literal_only_template() {
        let t = DestinationTemplate::parse("/fixed/path").unwrap();
        assert_eq!(t.render(&fields()), "/fixed/path");
    }

    #[test]
    fn test_unknown_field_is_config_error() {
        let err = DestinationTemplate::parse("/x/{{ .Owner }}").unwrap_err();
        assert!(matches!(err, IngestorError::Config(_)));
        assert!(err.to_string().contains("Owner"));
    }

    #[test]
    fn test_unsupported_function_is_config_error() {
        assert!(DestinationTemplate::parse("{{ upper .Pid }}").is_err());
    }

    #[test]
    fn test_posix_helpers() {
        assert_eq!(posix_base("a/b/c"), "c");
        assert_eq!(posix_base("c"), "c");
        assert_eq!(posix_dir("a/b/c"), "a/b");
        assert_eq!(posix_dir("c"), ".");
        assert_eq!(posix_dir("/c"), "/");
        assert_eq!(posix_join("/prefix/", "/ds/run"), "/prefix/ds/run");
        assert_eq!(posix_join("", "ds"), "ds");
        assert_eq!(to_posix(Path::new("/data/raw/run")), "/data/raw/run");
    }
}
