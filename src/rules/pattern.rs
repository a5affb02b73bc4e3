//! String template segments. Grounded on `strpartial.c`: a parsed pattern
//! is a sequence of segments resolved against the current execution
//! context at WRITE/ASSIGN time.

use chrono::Local;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Verbatim(String),
    Var(String),
    Env(String),
    CaptureGroup(usize),
    DateTime,
    FractSecond,
    DateTimeFract,
    Source,
    LogLine,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern(pub Vec<Segment>);

#[derive(Debug, snafu::Snafu)]
pub enum PatternError {
    #[snafu(display("unterminated %{{...}} escape in pattern {pattern:?}"))]
    Unterminated { pattern: String },
    #[snafu(display("empty %{{}} escape in pattern {pattern:?}"))]
    Empty { pattern: String },
}

/// Parses `text`, recognizing `%{...}` escapes:
/// `%{NAME}` -> a variable reference, `%{env:NAME}` -> an environment
/// lookup, `%{N}` (all-digit) -> a regex capture group, and the single
/// letters `T`/`F`/`TF`/`S`/`L` -> datetime / fractional-seconds /
/// combined / source-symbol / raw-logline. Anything else is verbatim text.
pub fn parse_pattern(text: &str) -> Result<Pattern, PatternError> {
    let mut segments = Vec::new();
    let mut verbatim = String::new();
    let mut rest = text;

    while let Some(mark) = rest.find("%{") {
        verbatim.push_str(&rest[..mark]);
        let after = &rest[mark + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| PatternError::Unterminated { pattern: text.to_owned() })?;
        let escape = &after[..close];
        if escape.is_empty() {
            return Err(PatternError::Empty { pattern: text.to_owned() });
        }
        if !verbatim.is_empty() {
            segments.push(Segment::Verbatim(std::mem::take(&mut verbatim)));
        }
        segments.push(classify_escape(escape));
        rest = &after[close + 1..];
    }
    verbatim.push_str(rest);
    if !verbatim.is_empty() {
        segments.push(Segment::Verbatim(verbatim));
    }
    Ok(Pattern(segments))
}

fn classify_escape(escape: &str) -> Segment {
    match escape {
        "T" => Segment::DateTime,
        "F" => Segment::FractSecond,
        "TF" => Segment::DateTimeFract,
        "S" => Segment::Source,
        "L" => Segment::LogLine,
        _ if escape.chars().all(|c| c.is_ascii_digit()) => {
            Segment::CaptureGroup(escape.parse().unwrap_or(0))
        }
        _ if escape.starts_with("env:") => Segment::Env(escape[4..].to_owned()),
        _ => Segment::Var(escape.to_owned()),
    }
}

/// Everything a [`Segment`] needs to resolve against the current line.
pub struct ResolveContext<'a> {
    pub source_symbol: &'a str,
    pub line: &'a str,
    pub captures: Option<&'a [Option<String>]>,
    pub datetime_format: &'a str,
    pub fractsecond_divider: u32,
    pub vars: &'a crate::table::StringTable<String>,
}

impl Pattern {
    /// Resolves the pattern to a string. `ENV` segments are memoized in
    /// place: the first resolution rewrites `Env(name)` to
    /// `Verbatim(value)` so later evaluations (even with a changed
    /// process environment) return the same value.
    pub fn resolve(&mut self, ctx: &ResolveContext) -> String {
        let mut out = String::new();
        for seg in self.0.iter_mut() {
            match seg {
                Segment::Verbatim(s) => out.push_str(s),
                Segment::Var(name) => {
                    if let Some(v) = ctx.vars.get(name) {
                        out.push_str(v);
                    }
                }
                Segment::Env(name) => {
                    let value = std::env::var(&*name).unwrap_or_default();
                    out.push_str(&value);
                    *seg = Segment::Verbatim(value);
                }
                Segment::CaptureGroup(n) => {
                    if let Some(caps) = ctx.captures {
                        if let Some(Some(v)) = caps.get(*n) {
                            out.push_str(v);
                        }
                    }
                }
                Segment::DateTime => {
                    out.push_str(&Local::now().format(ctx.datetime_format).to_string());
                }
                Segment::FractSecond => {
                    out.push_str(&fractsecond_string(ctx.fractsecond_divider));
                }
                Segment::DateTimeFract => {
                    out.push_str(&Local::now().format(ctx.datetime_format).to_string());
                    out.push('.');
                    out.push_str(&fractsecond_string(ctx.fractsecond_divider));
                }
                Segment::Source => out.push_str(ctx.source_symbol),
                Segment::LogLine => out.push_str(ctx.line),
            }
        }
        out
    }
}

fn fractsecond_string(divider: u32) -> String {
    let nanos = Local::now().timestamp_subsec_nanos();
    if divider <= 1 {
        nanos.to_string()
    } else {
        (nanos / divider).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::StringTable;

    fn ctx<'a>(vars: &'a StringTable<String>, line: &'a str) -> ResolveContext<'a> {
        ResolveContext {
            source_symbol: "A",
            line,
            captures: None,
            datetime_format: "%FT%T",
            fractsecond_divider: 1,
            vars,
        }
    }

    #[test]
    fn verbatim_and_var_segments() {
        let mut vars = StringTable::with_buckets(4);
        vars.upsert("name", "world".to_owned());
        let mut p = parse_pattern("hello %{name}\n").unwrap();
        let c = ctx(&vars, "");
        assert_eq!(p.resolve(&c), "hello world\n");
    }

    #[test]
    fn capture_group_resolution() {
        let vars = StringTable::with_buckets(4);
        let mut p = parse_pattern("%{1}\n").unwrap();
        let mut c = ctx(&vars, "");
        let caps = vec![None, Some("matched".to_owned())];
        c.captures = Some(&caps);
        assert_eq!(p.resolve(&c), "matched\n");
    }

    #[test]
    fn env_segment_memoizes_after_first_resolution() {
        std::env::set_var("LOGRELAY_TEST_VAR", "first");
        let vars = StringTable::with_buckets(4);
        let mut p = parse_pattern("%{env:LOGRELAY_TEST_VAR}").unwrap();
        let c = ctx(&vars, "");
        assert_eq!(p.resolve(&c), "first");
        std::env::set_var("LOGRELAY_TEST_VAR", "second");
        assert_eq!(p.resolve(&c), "first");
        assert_eq!(p.0, vec![Segment::Verbatim("first".to_owned())]);
    }

    #[test]
    fn unterminated_escape_is_an_error() {
        assert!(parse_pattern("%{oops").is_err());
    }
}
