//! Stage configuration file parser.
//!
//! A line-oriented directive file:
//!
//! | Directive | Action |
//! |-----------|--------|
//! | `/name <name>` | owner name used in diagnostics |
//! | `/server <host[:port]>` | interpreter address (default port 6311) |
//! | `/rdata <file>` | data file loaded into every new session |
//! | `/connect <file>`, `/evaluate <file>`, `/disconnect <file>` | scripts |
//! | `/pool [-m<max>] [-n<min-idle>] [-i<idle-secs>] [-w<sweep-ms>]` | pool sizing |
//! | `/namespace <prefix> <uri>` | namespace prefix for path expressions |
//! | `/param [-t<table>] <name> <type> <direction> <path>` | one binding row |
//! | Lines starting with `;` | comment, ignored |
//!
//! Relative file paths are taken as given; [`Config::load_file`] resolves
//! them against the config file's directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::binding::ParamRow;
use crate::path::NamespaceBindings;
use crate::pool::PoolConfig;

// ── Server address ────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 6311;

/// `host[:port]` of an Rserve server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self { host: "localhost".to_owned(), port: DEFAULT_PORT }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| format!("invalid port number: {port}"))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(format!("invalid server address: {s:?}"));
        }
        Ok(Self { host: host.to_owned(), port })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Parsed stage configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub server: ServerAddress,
    pub rdata: Option<PathBuf>,
    pub connect: Option<PathBuf>,
    pub evaluate: Option<PathBuf>,
    pub disconnect: Option<PathBuf>,
    pub pool: PoolConfig,
    pub namespaces: NamespaceBindings,
    /// Parameter rows in declaration order.
    pub params: Vec<ParamRow>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "rstage".to_owned(),
            server: ServerAddress::default(),
            rdata: None,
            connect: None,
            evaluate: None,
            disconnect: None,
            pool: PoolConfig::default(),
            namespaces: NamespaceBindings::new(),
            params: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config string.
    ///
    /// Returns the config and a list of errors, one per rejected line.
    /// Rejected lines leave the config as it was.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Config::new();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let Some(rest) = line.strip_prefix('/') else {
                errors.push(ConfigError { line: lineno, message: format!("expected a /directive: {line}") });
                continue;
            };

            let (cmd, args_str) = rest
                .split_once(|c: char| c.is_ascii_whitespace())
                .unwrap_or((rest, ""));
            let tokens = split_args(args_str.trim());

            if let Err(message) = config.apply(cmd, &tokens) {
                errors.push(ConfigError { line: lineno, message });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file from disk.
    ///
    /// Relative script and data paths are resolved against the directory
    /// holding the config file.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        let (mut config, errors) = Self::load_str(&s);
        if let Some(base) = path.parent() {
            for file in [&mut config.rdata, &mut config.connect, &mut config.evaluate, &mut config.disconnect]
                .into_iter()
                .flatten()
            {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
        Ok((config, errors))
    }

    fn apply(&mut self, cmd: &str, tokens: &[String]) -> Result<(), String> {
        match cmd {
            "name" => self.name = single(cmd, tokens)?.to_owned(),
            "server" => self.server = single(cmd, tokens)?.parse()?,
            "rdata" => self.rdata = Some(PathBuf::from(single(cmd, tokens)?)),
            "connect" => self.connect = Some(PathBuf::from(single(cmd, tokens)?)),
            "evaluate" => self.evaluate = Some(PathBuf::from(single(cmd, tokens)?)),
            "disconnect" => self.disconnect = Some(PathBuf::from(single(cmd, tokens)?)),
            "pool" => self.pool = parse_pool(tokens, self.pool.clone())?,
            "namespace" => match tokens {
                [prefix, uri] => self.namespaces.bind(prefix.as_str(), uri.as_str()),
                _ => return Err("/namespace: expected <prefix> <uri>".into()),
            },
            "param" => self.params.push(parse_param(tokens)?),
            other => return Err(format!("unknown directive /{other}")),
        }
        Ok(())
    }
}

fn single<'a>(cmd: &str, tokens: &'a [String]) -> Result<&'a str, String> {
    match tokens {
        [one] => Ok(one.as_str()),
        [] => Err(format!("/{cmd}: requires an argument")),
        _ => Err(format!("/{cmd}: expected one argument, got {}", tokens.len())),
    }
}

// ── Argument tokenizer ────────────────────────────────────────────────────────

/// Split `s` into whitespace-delimited tokens, honouring double-quoted strings
/// and `\"` escapes within them.
fn split_args(s: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    cur.push(escaped);
                }
            }
            c if c.is_ascii_whitespace() && !in_quotes => {
                if !cur.is_empty() || quoted {
                    args.push(std::mem::take(&mut cur));
                }
                quoted = false;
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() || quoted {
        args.push(cur);
    }
    args
}

// ── Flags ─────────────────────────────────────────────────────────────────────

struct Opts {
    /// `(flag, value)` pairs in order of appearance.
    values: Vec<(char, String)>,
    positional: Vec<String>,
}

/// Split flags from positional arguments.
///
/// Every flag named in `accepted` takes a value, attached (`-m4`) or
/// separate (`-m 4`).  A lone `-` or anything after `--` is positional, so
/// are negative-looking tokens once positional arguments have begun.
fn parse_opts(cmd: &str, tokens: &[String], accepted: &str) -> Result<Opts, String> {
    let mut values = Vec::new();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];

        if tok == "--" {
            positional.extend(tokens[i + 1..].iter().cloned());
            break;
        }
        if positional.is_empty() && tok.starts_with('-') && tok.len() > 1 {
            let mut chars = tok[1..].chars();
            let Some(flag) = chars.next() else { break };
            if !accepted.contains(flag) {
                return Err(format!("/{cmd}: unknown option -{flag}"));
            }
            let inline: String = chars.collect();
            let value = if !inline.is_empty() {
                inline
            } else {
                i += 1;
                tokens
                    .get(i)
                    .cloned()
                    .ok_or_else(|| format!("/{cmd}: -{flag} requires a value"))?
            };
            values.push((flag, value));
        } else {
            positional.push(tok.clone());
        }

        i += 1;
    }

    Ok(Opts { values, positional })
}

fn number<T: FromStr>(cmd: &str, flag: char, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("/{cmd}: -{flag} expects a non-negative number, got {value:?}"))
}

// ── /pool ─────────────────────────────────────────────────────────────────────

fn parse_pool(tokens: &[String], mut pool: PoolConfig) -> Result<PoolConfig, String> {
    let opts = parse_opts("pool", tokens, "mniw")?;
    if !opts.positional.is_empty() {
        return Err(format!("/pool: unexpected argument {:?}", opts.positional[0]));
    }
    for (flag, value) in &opts.values {
        match flag {
            'm' => pool.max_sessions = number("pool", *flag, value)?,
            'n' => pool.min_idle = number("pool", *flag, value)?,
            'i' => pool.idle_timeout = Duration::from_secs(number("pool", *flag, value)?),
            'w' => pool.sweep_interval = Duration::from_millis(number("pool", *flag, value)?),
            _ => {}
        }
    }
    if pool.max_sessions == 0 {
        return Err("/pool: maximum sessions must be at least 1".into());
    }
    if pool.min_idle > pool.max_sessions {
        return Err(format!(
            "/pool: minimum idle sessions ({}) exceeds maximum ({})",
            pool.min_idle, pool.max_sessions
        ));
    }
    if pool.sweep_interval.is_zero() {
        return Err("/pool: sweep interval must be positive".into());
    }
    Ok(pool)
}

// ── /param ────────────────────────────────────────────────────────────────────

/// Parse `/param [-t<table>] <name> <type> <direction> <path>`.
///
/// Only the shape is checked here; names, tokens and paths are validated
/// when the rows are resolved into bindings.
fn parse_param(tokens: &[String]) -> Result<ParamRow, String> {
    let opts = parse_opts("param", tokens, "t")?;
    let table = opts.values.into_iter().last().map(|(_, t)| t);
    match <[String; 4]>::try_from(opts.positional) {
        Ok([name, type_token, direction_token, path]) => {
            Ok(ParamRow { table, name, type_token, direction_token, path })
        }
        Err(pos) => Err(format!(
            "/param: expected <name> <type> <direction> <path>, got {} argument(s)",
            pos.len()
        )),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- split_args -----------------------------------------------------------

    #[test]
    fn split_simple() {
        assert_eq!(split_args("foo bar baz"), ["foo", "bar", "baz"]);
    }

    #[test]
    fn split_quoted_spaces() {
        assert_eq!(split_args(r#""count(/a/b) + 1" IN"#), ["count(/a/b) + 1", "IN"]);
    }

    #[test]
    fn split_escaped_quote_inside_quotes() {
        assert_eq!(split_args(r#""say \"hi\"""#), [r#"say "hi""#]);
    }

    #[test]
    fn split_keeps_empty_quoted_token() {
        assert_eq!(split_args(r#"a "" b"#), ["a", "", "b"]);
    }

    // -- /server --------------------------------------------------------------

    #[test]
    fn server_address_forms() {
        assert_eq!(
            "r.example.com".parse::<ServerAddress>().unwrap(),
            ServerAddress { host: "r.example.com".into(), port: 6311 }
        );
        assert_eq!("10.0.0.2:7000".parse::<ServerAddress>().unwrap().port, 7000);
        assert!("host:notaport".parse::<ServerAddress>().is_err());
        assert!(":6311".parse::<ServerAddress>().is_err());
        assert_eq!(ServerAddress::default().to_string(), "localhost:6311");
    }

    #[test]
    fn server_directive() {
        let (cfg, errs) = Config::load_str("/server rhost:6400");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.server.host, "rhost");
        assert_eq!(cfg.server.port, 6400);
    }

    // -- /pool ----------------------------------------------------------------

    #[test]
    fn pool_defaults() {
        let (cfg, _) = Config::load_str("");
        assert_eq!(cfg.pool, PoolConfig::default());
        assert_eq!(cfg.name, "rstage");
    }

    #[test]
    fn pool_flags_attached_and_separate() {
        let (cfg, errs) = Config::load_str("/pool -m4 -n 2 -i30 -w 250");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.pool.max_sessions, 4);
        assert_eq!(cfg.pool.min_idle, 2);
        assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.pool.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn pool_rejects_bad_values() {
        for line in ["/pool -mfour", "/pool -m0", "/pool -m2 -n3", "/pool -x1", "/pool -m", "/pool 4"] {
            let (cfg, errs) = Config::load_str(line);
            assert_eq!(errs.len(), 1, "{line}");
            assert_eq!(cfg.pool, PoolConfig::default(), "{line}");
        }
    }

    // -- /param ---------------------------------------------------------------

    #[test]
    fn param_scalar_row() {
        let (cfg, errs) = Config::load_str("/param x INTEGER IN $Root/Msg/X");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(
            cfg.params,
            [ParamRow {
                table: None,
                name: "x".into(),
                type_token: "INTEGER".into(),
                direction_token: "IN".into(),
                path: "$Root/Msg/X".into(),
            }]
        );
    }

    #[test]
    fn param_column_row() {
        let (cfg, errs) = Config::load_str(
            "/param df DATA_FRAME INOUT /Msg/Row\n\
             /param -tdf id R_INTEGER IN Id\n\
             /param -t df name CHARACTER OUT \"?Name\"",
        );
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.params.len(), 3);
        assert_eq!(cfg.params[1].table.as_deref(), Some("df"));
        assert_eq!(cfg.params[2].table.as_deref(), Some("df"));
        assert_eq!(cfg.params[2].path, "?Name");
    }

    #[test]
    fn param_wrong_arity_is_error() {
        let (cfg, errs) = Config::load_str("/param x INTEGER IN");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].line, 1);
        assert!(cfg.params.is_empty());
    }

    #[test]
    fn param_path_may_start_with_dash() {
        let (cfg, errs) = Config::load_str("/param x DOUBLE IN -- -1");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.params[0].path, "-1");
    }

    // -- Files, comments & errors ---------------------------------------------

    #[test]
    fn script_directives() {
        let (cfg, errs) = Config::load_str(
            "/rdata init.RData\n/connect on_connect.R\n/evaluate main.R\n/disconnect bye.R",
        );
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.rdata, Some(PathBuf::from("init.RData")));
        assert_eq!(cfg.connect, Some(PathBuf::from("on_connect.R")));
        assert_eq!(cfg.evaluate, Some(PathBuf::from("main.R")));
        assert_eq!(cfg.disconnect, Some(PathBuf::from("bye.R")));
    }

    #[test]
    fn load_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.rc");
        std::fs::write(&path, "/evaluate main.R\n/connect /abs/c.R\n").unwrap();
        let (cfg, errs) = Config::load_file(&path).unwrap();
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.evaluate, Some(dir.path().join("main.R")));
        assert_eq!(cfg.connect, Some(PathBuf::from("/abs/c.R")));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let (cfg, errs) = Config::load_str(";; header\n\n; note\n/name scorer\n");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.name, "scorer");
    }

    #[test]
    fn unknown_directive_is_error() {
        let (_, errs) = Config::load_str("/name a\n/def -i x = y\nplain text");
        assert_eq!(errs.iter().map(|e| e.line).collect::<Vec<_>>(), [2, 3]);
        assert!(errs[0].to_string().starts_with("line 2: unknown directive /def"));
    }

    #[test]
    fn namespace_directive() {
        let (cfg, errs) = Config::load_str("/namespace s http://example.com/s\n/namespace bad");
        assert_eq!(errs.len(), 1);
        assert_eq!(cfg.namespaces.resolve("s"), Some("http://example.com/s"));
    }

    #[test]
    fn realistic_config() {
        let src = "\
;; scoring stage\n\
/name scorer\n\
/server rserve.internal\n\
/evaluate score.R\n\
/pool -m 4 -n 1\n\
/namespace o http://example.com/order\n\
\n\
/param amount DOUBLE IN $Root/o:Order/o:Amount\n\
/param score DOUBLE OUT $OutputRoot/?Result/?Score\n\
";
        let (cfg, errs) = Config::load_str(src);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.pool.max_sessions, 4);
        assert_eq!(cfg.params.len(), 2);
    }
}
