//! Kernel commandline templating.
//!
//! A cmdline is a plain string with embedded helper invocations of the
//! form `{{ HELPER "argument" }}`. Exactly one helper is registered per
//! expansion pass: the booter layer rewrites `URL` invocations into `ID`
//! invocations, and the HTTP layer turns `ID` invocations into absolute
//! file-proxy URLs. Unknown helpers and malformed directives fail the
//! expansion loudly so typos cannot produce a silently wrong boot.

use crate::error::Error;

/// Expands every `{{ helper "arg" }}` directive in `template` by calling
/// `f(arg)`. The result is whitespace-trimmed and must not span lines.
pub fn expand_cmdline<F>(template: &str, helper: &str, mut f: F) -> Result<String, Error>
where
    F: FnMut(&str) -> Result<String, Error>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            Error::Template(format!("unterminated directive in cmdline {:?}", template))
        })?;
        let directive = after[..end].trim();
        let arg = parse_invocation(directive, helper, template)?;
        out.push_str(&f(arg)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    let out = out.trim().to_string();
    if out.contains('\n') {
        return Err(Error::Template(format!(
            "cmdline {:?} contains a newline",
            out
        )));
    }
    Ok(out)
}

/// Parses `HELPER "arg"`, requiring the helper name to match.
fn parse_invocation<'a>(
    directive: &'a str,
    helper: &str,
    template: &str,
) -> Result<&'a str, Error> {
    let rest = directive.strip_prefix(helper).ok_or_else(|| {
        Error::Template(format!(
            "unknown function {:?} in cmdline {:?}",
            directive.split_whitespace().next().unwrap_or(""),
            template
        ))
    })?;
    if !rest.starts_with(char::is_whitespace) {
        // No separation between helper name and argument, e.g. "IDx".
        return Err(Error::Template(format!(
            "unknown function in cmdline {:?}",
            template
        )));
    }
    let arg = rest
        .trim_start()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| {
            Error::Template(format!(
                "malformed directive {:?} in cmdline {:?}",
                directive, template
            ))
        })?;
    if arg.contains('"') {
        return Err(Error::Template(format!(
            "malformed directive {:?} in cmdline {:?}",
            directive, template
        )));
    }
    Ok(arg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let out = expand_cmdline("console=ttyS0 quiet", "ID", |_| unreachable!()).unwrap();
        assert_eq!(out, "console=ttyS0 quiet");
    }

    #[test]
    fn directives_expand_in_place() {
        let out = expand_cmdline(
            r#"thing={{ ID "f-0" }} foo=bar"#,
            "ID",
            |arg| Ok(format!("<{}>", arg)),
        )
        .unwrap();
        assert_eq!(out, "thing=<f-0> foo=bar");
    }

    #[test]
    fn multiple_directives() {
        let out = expand_cmdline(
            r#"a={{ URL "one" }} b={{ URL "two" }}"#,
            "URL",
            |arg| Ok(arg.to_uppercase()),
        )
        .unwrap();
        assert_eq!(out, "a=ONE b=TWO");
    }

    #[test]
    fn output_is_trimmed() {
        let out = expand_cmdline("  foo=bar  ", "ID", |_| unreachable!()).unwrap();
        assert_eq!(out, "foo=bar");
    }

    #[test]
    fn unknown_helper_fails() {
        let err = expand_cmdline(r#"x={{ URL "u" }}"#, "ID", |_| unreachable!());
        assert!(matches!(err, Err(Error::Template(_))));
    }

    #[test]
    fn unterminated_directive_fails() {
        let err = expand_cmdline(r#"x={{ ID "u" "#, "ID", |arg| Ok(arg.to_string()));
        assert!(matches!(err, Err(Error::Template(_))));
    }

    #[test]
    fn missing_quotes_fail() {
        let err = expand_cmdline("x={{ ID u }}", "ID", |arg| Ok(arg.to_string()));
        assert!(matches!(err, Err(Error::Template(_))));
    }

    #[test]
    fn embedded_newline_fails() {
        let err = expand_cmdline(r#"x={{ ID "u" }}"#, "ID", |_| Ok("a\nb".to_string()));
        assert!(matches!(err, Err(Error::Template(_))));
    }

    #[test]
    fn helper_errors_propagate() {
        let err = expand_cmdline(r#"x={{ ID "u" }}"#, "ID", |_| {
            Err(Error::Template("boom".to_string()))
        });
        assert!(matches!(err, Err(Error::Template(_))));
    }
}
