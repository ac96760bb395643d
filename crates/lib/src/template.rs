//! Strict `$VAR` / `${VAR}` substitution (§4.B).
//!
//! Fail-closed: an unknown variable or a malformed `$`-escape aborts
//! rendering with [`SysContainerError::BadTemplate`]. This is a deliberate
//! contract — it shifts configuration errors from runtime-of-the-container
//! to install-time.

use std::collections::HashMap;
use std::io::Write as _;

use anyhow::{Context, Result};

use crate::error::SysContainerError;

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn bad_template(msg: impl Into<String>) -> anyhow::Error {
    SysContainerError::BadTemplate(msg.into()).into()
}

fn lookup(values: &HashMap<String, String>, name: &str) -> Result<&str> {
    values
        .get(name)
        .map(|s| s.as_str())
        .ok_or_else(|| bad_template(format!("invalid template, cannot find variable {name}")))
}

/// Render `input` against `values`, writing the result to `out`.
pub fn render(input: &[u8], values: &HashMap<String, String>, out: &mut Vec<u8>) -> Result<()> {
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b != b'$' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&next) = input.get(i) else {
            return Err(bad_template("unexpected end of input after '$'"));
        };
        if next == b'$' {
            out.push(b'$');
            i += 1;
        } else if next == b'{' {
            i += 1;
            let start = i;
            while input.get(i).is_some_and(|&c| c != b'}') {
                i += 1;
            }
            if i >= input.len() {
                return Err(bad_template("unterminated ${...} reference"));
            }
            let name = std::str::from_utf8(&input[start..i])
                .context("template variable name is not valid UTF-8")?;
            out.write_all(lookup(values, name)?.as_bytes())?;
            i += 1; // past the closing '}'
        } else if is_name_byte(next) {
            let start = i;
            while input.get(i).is_some_and(|&c| is_name_byte(c)) {
                i += 1;
            }
            if i >= input.len() {
                return Err(bad_template("unexpected end of input inside $NAME"));
            }
            let name = std::str::from_utf8(&input[start..i])
                .context("template variable name is not valid UTF-8")?;
            out.write_all(lookup(values, name)?.as_bytes())?;
            // The byte that ended the name is emitted verbatim on the next
            // loop iteration.
        } else {
            return Err(bad_template("invalid template variable"));
        }
    }
    Ok(())
}

/// In-memory string→string driver.
pub fn render_string(input: &str, values: &HashMap<String, String>) -> Result<String> {
    let mut out = Vec::with_capacity(input.len());
    render(input.as_bytes(), values, &mut out)?;
    String::from_utf8(out).context("rendered template is not valid UTF-8")
}

/// File→file driver. If `src` does not exist and `default` is non-empty,
/// renders `default` instead; if `src` does not exist and `default` is
/// empty, the destination is not written at all.
pub fn render_file_with_default(
    src: &camino::Utf8Path,
    dest: &camino::Utf8Path,
    default: &str,
    values: &HashMap<String, String>,
) -> Result<()> {
    let input = match std::fs::read(src) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if default.is_empty() {
                return Ok(());
            }
            default.as_bytes().to_vec()
        }
        Err(e) => return Err(e).with_context(|| format!("reading template {src}")),
    };
    let mut out = Vec::with_capacity(input.len());
    render(&input, values, &mut out).with_context(|| format!("rendering template {src}"))?;
    std::fs::write(dest, out).with_context(|| format!("writing rendered template {dest}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn dollar_dollar_is_literal_dollar() {
        assert_eq!(render_string("$$", &values(&[])).unwrap(), "$");
    }

    #[test]
    fn bare_dollar_is_an_error() {
        assert!(render_string("$", &values(&[])).is_err());
    }

    #[test]
    fn simple_variable_substitution() {
        let v = values(&[("NAME", "app")]);
        assert_eq!(render_string("hello $NAME!", &v).unwrap(), "hello app!");
    }

    #[test]
    fn braced_variable_any_bytes_up_to_close_brace() {
        let v = values(&[("DOES_NOT_EXIST", "x")]);
        // Name can contain characters invalid in the bare form.
        let v2 = {
            let mut v = v.clone();
            v.insert("a-b".to_string(), "ok".to_string());
            v
        };
        assert_eq!(render_string("${a-b}", &v2).unwrap(), "ok");
    }

    #[test]
    fn greedy_name_ends_at_first_non_name_byte() {
        let v = values(&[("NAME", "x")]);
        assert_eq!(render_string("$NAME!", &v).unwrap(), "x!");
    }

    #[test]
    fn unknown_variable_is_bad_template_with_name_in_message() {
        let err = render_string("$NOPE", &values(&[])).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn eof_inside_brace_reference_is_an_error() {
        assert!(render_string("${UNCLOSED", &values(&[])).is_err());
    }

    #[test]
    fn eof_inside_bare_name_is_an_error() {
        // Per spec, reaching EOF while inside $NAME is a hard error, just
        // like EOF while inside ${.
        let v = values(&[("NAME", "x")]);
        assert!(render_string("$NAME", &v).is_err());
    }
}
