//! Parses the `scp` command line and transfer control messages.

use tracing::warn;

use super::types::{ScpError, ScpMessage, ScpOptions};

/// Splits an exec request payload with POSIX shell quoting rules.
///
/// Unbalanced quoting is logged and recovery falls back to plain whitespace
/// splitting, matching the historical server's lenient behavior.
pub fn tokenize_command(raw: &str) -> Vec<String> {
    match shell_words::split(raw) {
        Ok(tokens) => tokens,
        Err(error) => {
            warn!(%error, command=%raw, "Malformed command line, recovering split tokens");
            raw.split_whitespace().map(str::to_owned).collect()
        }
    }
}

/// Folds command arguments into an [`ScpOptions`] record.
///
/// Flag combinations are not validated here; the transfer engine decides
/// what an acceptable combination is.
pub fn parse_options(args: &[String]) -> ScpOptions {
    let mut options = ScpOptions::default();
    let mut parse_flags = true;
    for arg in args {
        if !parse_flags {
            options.file_names.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "-f" => options.from = true,
            "-t" => options.to = true,
            "-d" => options.target_is_dir = true,
            "-p" => options.preserve = true,
            "-r" => options.recursive = true,
            // Verbose mode, this is more of a local client thing
            "-v" => (),
            "--" => parse_flags = false,
            _ => options.file_names.push(arg.clone()),
        }
    }
    options
}

/// Parses one control line (without trailing newline handling required of
/// the caller; a trailing `\n` or `\r\n` is accepted).
pub fn parse_message(line: &str) -> Result<ScpMessage, ScpError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.as_bytes().first() {
        Some(b'C') => parse_file_header(line),
        Some(b'D') => parse_dir_header(line),
        Some(b'E') if line.len() == 1 => Ok(ScpMessage::EndDir),
        Some(b'T') => parse_times(line),
        _ => Err(ScpError::Parse(format!("unrecognized control line {line:?}"))),
    }
}

fn parse_file_header(line: &str) -> Result<ScpMessage, ScpError> {
    let parts: Vec<&str> = line[1..].splitn(3, ' ').collect();
    let [mode, size, name] = parts[..] else {
        return Err(ScpError::Parse(format!("malformed file header {line:?}")));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| ScpError::Parse(format!("bad mode in {line:?}")))?;
    let size = size
        .parse()
        .map_err(|_| ScpError::Parse(format!("bad size in {line:?}")))?;
    if name.is_empty() {
        return Err(ScpError::Parse(format!("empty name in {line:?}")));
    }
    Ok(ScpMessage::FileHeader {
        mode,
        size,
        name: name.to_owned(),
    })
}

fn parse_dir_header(line: &str) -> Result<ScpMessage, ScpError> {
    let parts: Vec<&str> = line[1..].splitn(3, ' ').collect();
    let [mode, _size, name] = parts[..] else {
        return Err(ScpError::Parse(format!(
            "malformed directory header {line:?}"
        )));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| ScpError::Parse(format!("bad mode in {line:?}")))?;
    if name.is_empty() {
        return Err(ScpError::Parse(format!("empty name in {line:?}")));
    }
    Ok(ScpMessage::DirHeader {
        mode,
        name: name.to_owned(),
    })
}

fn parse_times(line: &str) -> Result<ScpMessage, ScpError> {
    let parts: Vec<&str> = line[1..].split(' ').collect();
    let [mtime, mtime_us, atime, atime_us] = parts[..] else {
        return Err(ScpError::Parse(format!("malformed times line {line:?}")));
    };
    let parse = |v: &str| {
        v.parse::<i64>()
            .map_err(|_| ScpError::Parse(format!("bad timestamp in {line:?}")))
    };
    let parse_us = |v: &str| {
        let us = parse(v)?;
        if !(0..=999_999).contains(&us) {
            return Err(ScpError::Parse(format!(
                "microseconds out of range in {line:?}"
            )));
        }
        Ok(us)
    };
    Ok(ScpMessage::Times {
        mtime: parse(mtime)?,
        mtime_us: parse_us(mtime_us)?,
        atime: parse(atime)?,
        atime_us: parse_us(atime_us)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_sink_command() {
        let options = parse_options(&args(&["-t", "/tmp/dest"]));
        assert!(options.to);
        assert!(!options.from);
        assert_eq!(options.file_names, vec!["/tmp/dest"]);
    }

    #[test]
    fn test_parse_source_command() {
        let options = parse_options(&args(&["-f", "a", "b"]));
        assert!(options.from);
        assert_eq!(options.file_names, vec!["a", "b"]);
    }

    #[test]
    fn test_flag_order_is_irrelevant() {
        let a = parse_options(&args(&["-r", "-p", "-t", "-d", "x"]));
        let b = parse_options(&args(&["-t", "-d", "-p", "-r", "x"]));
        assert_eq!(a, b);
        assert!(a.recursive && a.preserve && a.to && a.target_is_dir);
    }

    #[test]
    fn test_double_dash_stops_flag_parsing() {
        let options = parse_options(&args(&["-t", "--", "-r", "-f"]));
        assert!(options.to);
        assert!(!options.recursive);
        assert!(!options.from);
        assert_eq!(options.file_names, vec!["-r", "-f"]);
    }

    #[test]
    fn test_verbose_is_ignored() {
        let options = parse_options(&args(&["-v", "-f", "x"]));
        assert_eq!(options.file_names, vec!["x"]);
    }

    #[test]
    fn test_unrecognized_token_is_a_file_name() {
        let options = parse_options(&args(&["-q", "-f", "x"]));
        assert_eq!(options.file_names, vec!["-q", "x"]);
    }

    #[test]
    fn test_tokenize_quoting() {
        assert_eq!(
            tokenize_command("scp -t 'my file.txt'"),
            vec!["scp", "-t", "my file.txt"]
        );
    }

    #[test]
    fn test_tokenize_recovers_from_unbalanced_quote() {
        assert_eq!(tokenize_command("scp -t 'oops"), vec!["scp", "-t", "'oops"]);
    }

    #[test]
    fn test_parse_file_header() {
        let msg = parse_message("C0644 1234 test.txt\n").unwrap();
        assert_eq!(
            msg,
            ScpMessage::FileHeader {
                mode: 0o644,
                size: 1234,
                name: "test.txt".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_file_header_name_with_spaces() {
        let msg = parse_message("C0644 4 my file.txt\n").unwrap();
        assert_eq!(
            msg,
            ScpMessage::FileHeader {
                mode: 0o644,
                size: 4,
                name: "my file.txt".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_dir_header() {
        let msg = parse_message("D0755 0 mydir\n").unwrap();
        assert_eq!(
            msg,
            ScpMessage::DirHeader {
                mode: 0o755,
                name: "mydir".to_owned()
            }
        );
    }

    #[test]
    fn test_parse_end_dir() {
        assert_eq!(parse_message("E\n").unwrap(), ScpMessage::EndDir);
    }

    #[test]
    fn test_parse_times() {
        let msg = parse_message("T1700000000 0 1700000001 500\n").unwrap();
        assert_eq!(
            msg,
            ScpMessage::Times {
                mtime: 1700000000,
                mtime_us: 0,
                atime: 1700000001,
                atime_us: 500
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_message("Z nonsense\n").is_err());
        assert!(parse_message("Cabc 12 x\n").is_err());
        assert!(parse_message("C0644 twelve x\n").is_err());
        assert!(parse_message("E trailing\n").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_microseconds() {
        assert!(parse_message("T1700000000 -1 1700000001 0\n").is_err());
        assert!(parse_message("T1700000000 0 1700000001 1000000\n").is_err());
        assert!(parse_message("T1700000000 999999 1700000001 0\n").is_ok());
    }

    #[test]
    fn test_wire_round_trip() {
        let msg = ScpMessage::FileHeader {
            mode: 0o600,
            size: 42,
            name: "data.bin".to_owned(),
        };
        assert_eq!(msg.to_wire(), "C0600 42 data.bin\n");
        assert_eq!(parse_message(&msg.to_wire()).unwrap(), msg);
    }
}
