use crate::error::{Error, Result};
use std::ffi::{CString, OsStr, OsString};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Accumulates the argv for the hypervisor child.
///
/// Built fresh inside the forked child from decisions committed before the
/// fork; it never touches state shared with the parent.
#[derive(Debug)]
pub(crate) struct ArgvBuilder {
    args: Vec<OsString>,
}

impl ArgvBuilder {
    /// Seed argv[0] with the hypervisor path.
    pub(crate) fn new(hypervisor: &Path) -> Self {
        Self {
            args: vec![hypervisor.as_os_str().to_owned()],
        }
    }

    /// Append one token verbatim.
    pub(crate) fn push(&mut self, arg: impl AsRef<OsStr>) {
        self.args.push(arg.as_ref().to_owned());
    }

    /// Append a string of zero or more shell-quoted options.
    ///
    /// A leading `'` or `"` opens a quoted token that runs to the next
    /// matching quote; an unquoted token runs to the next space. The
    /// unquoting is deliberately simple: a closing quote must be followed
    /// by a space or the end of the string, and there are no escapes.
    pub(crate) fn push_shell(&mut self, options: &str) -> Result<()> {
        let bytes = options.as_bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            if bytes[pos] == b' ' {
                pos += 1;
                continue;
            }

            let (quote, start) = match bytes[pos] {
                q @ (b'\'' | b'"') => (q, pos + 1),
                _ => (b' ', pos),
            };

            let end = match bytes[start..].iter().position(|&c| c == quote) {
                Some(offset) => start + offset,
                None if quote == b' ' => bytes.len(),
                None => {
                    return Err(Error::CmdlineParse(format!(
                        "unclosed quote character ({}) in command line near: {}",
                        quote as char,
                        &options[pos..],
                    )));
                }
            };

            let next = if quote == b' ' {
                // Past the delimiting space, if any.
                (end + 1).min(bytes.len())
            } else if end + 1 == bytes.len() {
                end + 1
            } else if bytes[end + 1] == b' ' {
                end + 2
            } else {
                return Err(Error::CmdlineParse(format!(
                    "cannot parse quoted string near: {}",
                    &options[pos..],
                )));
            };

            self.push(&options[start..end]);
            pos = next;
        }

        Ok(())
    }

    /// Convert to the exec-ready vector. The exec call supplies the
    /// terminating null itself.
    pub(crate) fn finalize(self) -> Result<Vec<CString>> {
        self.args
            .into_iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("argument contains an embedded NUL: {arg:?}"),
                    ))
                })
            })
            .collect()
    }

    /// Dump the command line to stderr, one `-option` per continuation
    /// line, quoting tokens that contain spaces. Called from the child
    /// after its stderr has been plumbed, so the output travels the same
    /// path as the hypervisor's own chatter.
    pub(crate) fn dump(&self, elapsed_ms: u128) {
        let mut out = format!("[{elapsed_ms:05}ms] ");
        for (i, arg) in self.args.iter().enumerate() {
            let arg = arg.to_string_lossy();
            if arg.starts_with('-') {
                out.push_str(" \\\n   ");
            }
            if i > 0 {
                out.push(' ');
            }
            let needs_quote = arg.contains(' ');
            if needs_quote {
                out.push('\'');
            }
            out.push_str(&arg);
            if needs_quote {
                out.push('\'');
            }
        }
        out.push('\n');
        let _ = std::io::stderr().write_all(out.as_bytes());
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}
