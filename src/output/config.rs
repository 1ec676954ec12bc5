use std::env;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub pretty: bool,
}

impl OutputConfig {
    pub fn from_env() -> Self {
        Self::parse(env::var("INGEST_OUTPUT_FORMAT").ok().as_deref(), env::var("INGEST_OUTPUT_PRETTY").ok().as_deref())
    }

    fn parse(format: Option<&str>, pretty: Option<&str>) -> Self {
        let format = match format {
            Some(f) if f.eq_ignore_ascii_case("json") => OutputFormat::Json,
            _ => OutputFormat::Text,
        };
        let pretty = matches!(pretty, Some(v) if v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"));
        OutputConfig { format, pretty }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_compact_text() {
        assert_eq!(OutputConfig::parse(None, None), OutputConfig { format: OutputFormat::Text, pretty: false });
        assert_eq!(OutputConfig::parse(Some("xml"), Some("no")).format, OutputFormat::Text);
    }

    #[test]
    fn reads_json_and_pretty() {
        let cfg = OutputConfig::parse(Some("JSON"), Some("yes"));
        assert_eq!(cfg, OutputConfig { format: OutputFormat::Json, pretty: true });
        assert!(OutputConfig::parse(None, Some("1")).pretty);
    }
}
