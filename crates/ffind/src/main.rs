//! ffind: thin query client for the indexing daemon.
//!
//! Speaks the daemon's binary request protocol over the local socket
//! and streams result lines to stdout, colorizing content matches when
//! stdout is a terminal. Flags follow find(1) conventions (`-name`,
//! `-mtime`), which is why argument parsing is by hand.

use std::io::{BufRead, BufReader, IsTerminal, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::exit;

const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_RESET: &str = "\x1b[0m";

#[derive(Default)]
struct Request {
    name_pat: String,
    path_pat: String,
    content_pat: String,
    case_insensitive: bool,
    content_regex: bool,
    content_glob: bool,
    type_filter: u8,
    size_op: u8,
    size_val: i64,
    mtime_op: u8,
    mtime_days: i32,
    before_ctx: u8,
    after_ctx: u8,
}

fn usage() {
    eprintln!(
        "Usage examples:\n  \
         ffind \"*.rs\"\n  \
         ffind -path \"src/*\" -type f\n  \
         ffind -size +1G -mtime -7\n  \
         ffind -c \"todo\" -r -i\n  \
         ffind -c \"fn main\" -A 2 -B 2"
    );
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        exit(1);
    }

    let request = match parse_args(&args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("{message}");
            exit(1);
        }
    };

    let socket_path = format!("/run/user/{}/ffind.sock", unsafe { libc::getuid() });
    let mut stream = match UnixStream::connect(&socket_path) {
        Ok(stream) => stream,
        Err(_) => {
            eprintln!("Daemon not running");
            exit(1);
        }
    };

    if stream.write_all(&encode(&request)).is_err() {
        eprintln!("Failed to send request");
        exit(1);
    }

    let colorize = request.has_content() && std::io::stdout().is_terminal();
    if colorize {
        stream_colorized(stream);
    } else {
        stream_raw(stream);
    }
}

impl Request {
    fn has_content(&self) -> bool {
        !self.content_pat.is_empty()
    }
}

fn parse_args(args: &[String]) -> Result<Request, String> {
    let mut request = Request {
        name_pat: "*".to_string(),
        ..Request::default()
    };

    let has_flags = args.iter().any(|arg| arg.starts_with('-'));
    if !has_flags && args.len() == 1 {
        request.name_pat = args[0].clone();
        return Ok(request);
    }

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value_for = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("Missing {flag} argument"))
        };
        match arg.as_str() {
            "-name" => request.name_pat = value_for("-name")?,
            "-path" => request.path_pat = value_for("-path")?,
            "-c" => request.content_pat = value_for("-c")?,
            "-type" => match value_for("-type")?.as_str() {
                "f" => request.type_filter = 1,
                "d" => request.type_filter = 2,
                _ => return Err("-type f|d only".to_string()),
            },
            "-size" => {
                let (op, value) = parse_size(&value_for("-size")?)?;
                request.size_op = op;
                request.size_val = value;
            }
            "-mtime" => {
                let (op, days) = parse_mtime(&value_for("-mtime")?)?;
                request.mtime_op = op;
                request.mtime_days = days;
            }
            "-A" => request.after_ctx = parse_context(&value_for("-A")?)?,
            "-B" => request.before_ctx = parse_context(&value_for("-B")?)?,
            "-C" => {
                let context = parse_context(&value_for("-C")?)?;
                request.before_ctx = context;
                request.after_ctx = context;
            }
            "-i" => request.case_insensitive = true,
            "-r" => request.content_regex = true,
            "-g" => request.content_glob = true,
            other => return Err(format!("Bad arg: {other}")),
        }
    }

    if request.content_regex && request.content_pat.is_empty() {
        return Err("-r needs -c".to_string());
    }
    if request.content_glob && request.content_pat.is_empty() {
        return Err("-g needs -c".to_string());
    }
    if request.content_regex && request.content_glob {
        return Err("-r and -g are mutually exclusive".to_string());
    }
    if (request.before_ctx > 0 || request.after_ctx > 0) && request.content_pat.is_empty() {
        return Err("-A/-B/-C need -c".to_string());
    }
    Ok(request)
}

/// find(1)-style size: optional +/- sign, number, optional unit
/// (c bytes, b 512-blocks, k, M, G).
fn parse_size(raw: &str) -> Result<(u8, i64), String> {
    let (sign, rest) = split_sign(raw);
    if rest.is_empty() {
        return Err("Missing -size value".to_string());
    }
    let (digits, unit) = match rest.chars().last() {
        Some(last) if last.is_ascii_digit() => (rest, 'c'),
        Some(last) => (&rest[..rest.len() - last.len_utf8()], last),
        None => return Err("Missing -size value".to_string()),
    };
    let number: i64 = digits.parse().map_err(|_| "Bad -size value".to_string())?;
    let multiplier: i64 = match unit {
        'c' => 1,
        'b' => 512,
        'k' => 1024,
        'M' => 1024 * 1024,
        'G' => 1024 * 1024 * 1024,
        _ => return Err("Bad unit".to_string()),
    };
    Ok((op_for_sign(sign), number * multiplier))
}

fn parse_mtime(raw: &str) -> Result<(u8, i32), String> {
    let (sign, rest) = split_sign(raw);
    let days: i32 = rest.parse().map_err(|_| "Bad -mtime value".to_string())?;
    if days < 0 {
        return Err("-mtime takes a positive day count".to_string());
    }
    Ok((op_for_sign(sign), days))
}

fn parse_context(raw: &str) -> Result<u8, String> {
    raw.parse().map_err(|_| "Bad context line count".to_string())
}

fn split_sign(raw: &str) -> (Option<char>, &str) {
    match raw.chars().next() {
        Some(sign @ ('+' | '-')) => (Some(sign), &raw[1..]),
        _ => (None, raw),
    }
}

/// `+` means greater, `-` means less, no sign means exact.
fn op_for_sign(sign: Option<char>) -> u8 {
    match sign {
        Some('+') => 3,
        Some('-') => 1,
        _ => 2,
    }
}

fn encode(request: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    for pattern in [&request.name_pat, &request.path_pat, &request.content_pat] {
        out.extend_from_slice(&(pattern.len() as u32).to_be_bytes());
        out.extend_from_slice(pattern.as_bytes());
    }
    let mut flags = 0u8;
    if request.case_insensitive {
        flags |= 1;
    }
    if request.content_regex {
        flags |= 2;
    }
    if request.content_glob {
        flags |= 4;
    }
    out.push(flags);
    out.push(request.type_filter);
    out.push(request.size_op);
    if request.size_op != 0 {
        out.extend_from_slice(&request.size_val.to_be_bytes());
    }
    out.push(request.mtime_op);
    if request.mtime_op != 0 {
        out.extend_from_slice(&request.mtime_days.to_be_bytes());
    }
    out.push(request.before_ctx);
    out.push(request.after_ctx);
    out
}

fn stream_raw(mut stream: UnixStream) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = out.flush();
}

/// Content result lines are `path:lineno(:|-)text`; paint the path
/// cyan and the line number green, leaving everything else alone.
fn stream_colorized(stream: UnixStream) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let written = match split_result_line(&line) {
            Some((path, lineno, sep, text)) => writeln!(
                out,
                "{COLOR_CYAN}{path}{COLOR_RESET}:{COLOR_GREEN}{lineno}{COLOR_RESET}{sep}{text}"
            ),
            None => writeln!(out, "{line}"),
        };
        if written.is_err() {
            break;
        }
    }
    let _ = out.flush();
}

/// Splits `path:lineno(:|-)rest`. The line number is the digit run
/// after the last `:` that is followed by `:` or `-`; paths may
/// themselves contain colons, so scan from the right.
fn split_result_line(line: &str) -> Option<(&str, &str, char, &str)> {
    for (index, _) in line.match_indices(':').collect::<Vec<_>>().into_iter().rev() {
        let rest = &line[index + 1..];
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits_end == 0 {
            continue;
        }
        let after = &rest[digits_end..];
        let mut chars = after.chars();
        match chars.next() {
            Some(sep @ (':' | '-')) => {
                return Some((&line[..index], &rest[..digits_end], sep, chars.as_str()));
            }
            _ => continue,
        }
    }
    None
}
