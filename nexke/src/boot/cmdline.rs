// SPDX-License-Identifier: MPL-2.0

//! Kernel command-line parsing: a null-terminated string of arguments of
//! the form `-name` or `name value`, parsed by token scan.

/// One parsed command-line argument.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmdlineArg<'a> {
    /// `-name`: a boolean flag.
    Flag(&'a str),
    /// `name value`: a key followed by its value token.
    KeyVal(&'a str, &'a str),
}

/// Scans `raw` into a sequence of [`CmdlineArg`]s.
pub fn tokens(raw: &str) -> impl Iterator<Item = CmdlineArg<'_>> {
    let mut it = raw.split_whitespace().peekable();
    core::iter::from_fn(move || {
        let tok = it.next()?;
        if let Some(name) = tok.strip_prefix('-') {
            return Some(CmdlineArg::Flag(name));
        }
        match it.peek() {
            Some(&value) => {
                it.next();
                Some(CmdlineArg::KeyVal(tok, value))
            }
            None => Some(CmdlineArg::KeyVal(tok, "")),
        }
    })
}

/// Returns whether flag `-name` is present anywhere on the command line.
pub fn has_flag(raw: &str, name: &str) -> bool {
    tokens(raw).any(|arg| matches!(arg, CmdlineArg::Flag(n) if n == name))
}

/// Returns the value of the first `name value` pair, if present.
pub fn get_value<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    tokens(raw).find_map(|arg| match arg {
        CmdlineArg::KeyVal(n, v) if n == name => Some(v),
        _ => None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_flags_and_key_values() {
        let raw = "-verbose loglevel 3 -quiet root /dev/sda1";
        let parsed: alloc::vec::Vec<_> = tokens(raw).collect();
        assert_eq!(
            parsed,
            alloc::vec![
                CmdlineArg::Flag("verbose"),
                CmdlineArg::KeyVal("loglevel", "3"),
                CmdlineArg::Flag("quiet"),
                CmdlineArg::KeyVal("root", "/dev/sda1"),
            ]
        );
        assert!(has_flag(raw, "verbose"));
        assert!(!has_flag(raw, "missing"));
        assert_eq!(get_value(raw, "loglevel"), Some("3"));
        assert_eq!(get_value(raw, "root"), Some("/dev/sda1"));
        assert_eq!(get_value(raw, "nope"), None);
    }
}
