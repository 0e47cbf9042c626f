//! Command-line argument parsing.
//!
//! Usage:
//!   rstage [-d] -f<config> [<message.xml>…]

use std::path::PathBuf;

pub const USAGE: &str = "Usage: rstage [-d] -f<config> [<message.xml>...]";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Stage configuration file (`-f<file>`).
    pub config: PathBuf,
    /// Debug logging (`-d`).
    pub debug: bool,
    /// Message files to evaluate; standard input when empty.
    pub messages: Vec<PathBuf>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut config: Option<PathBuf> = None;
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        // `--` ends flag processing.
        if arg == "--" {
            args.messages.extend(argv[i + 1..].iter().map(PathBuf::from));
            break;
        }

        if !arg.starts_with('-') || arg == "-" {
            args.messages.push(PathBuf::from(arg));
            i += 1;
            continue;
        }

        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'd' => args.debug = true,

                // -f<file> or -f <file>
                'f' => {
                    let file = if j + 1 < chars.len() {
                        let s: String = chars[j + 1..].iter().collect();
                        j = chars.len();
                        s
                    } else if i + 1 < argv.len() {
                        i += 1;
                        argv[i].clone()
                    } else {
                        return Err("-f requires a config file argument".to_owned());
                    };
                    config = Some(PathBuf::from(file));
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    args.config = config.ok_or_else(|| "a config file is required (-f<config>)".to_owned())?;
    Ok(args)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
