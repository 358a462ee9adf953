// SPDX-License-Identifier: BUSL-1.1

use std::ffi::OsString;
use std::io::{self, Read, Write};

use geofed::observability::init_tracing;
use geofed::{FederatedQuery, FederatedResult, FederationConfig};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliOptions {
    config_path: Option<String>,
    sql: Option<String>,
    stats: bool,
    show_help: bool,
}

#[tokio::main]
async fn main() {
    let exit_code = run(std::env::args_os()).await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

async fn run<I>(args: I) -> i32
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = io::stdout();
    let mut err = io::stderr();

    let options = match parse_args(args) {
        Ok(options) => options,
        Err(message) => {
            let _ = writeln!(err, "error: {message}");
            let _ = write_usage(&mut err);
            return 2;
        }
    };
    if options.show_help {
        return if write_usage(&mut out).is_ok() { 0 } else { 1 };
    }

    let loaded = match options.config_path.as_deref() {
        Some(path) => FederationConfig::from_file(path),
        None => FederationConfig::from_env(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            let _ = writeln!(err, "error: {e}");
            return 1;
        }
    };
    init_tracing(&config.logging);

    let sql = match options.sql {
        Some(sql) => sql,
        None => {
            let mut buffer = String::new();
            if let Err(e) = io::stdin().read_to_string(&mut buffer) {
                let _ = writeln!(err, "error: failed to read SQL from stdin: {e}");
                return 1;
            }
            buffer
        }
    };
    if sql.trim().is_empty() {
        let _ = writeln!(err, "error: no SQL given");
        return 2;
    }

    let federation = match FederatedQuery::from_config(&config).await {
        Ok(federation) => federation,
        Err(e) => {
            tracing::error!(error = %e, "Federation setup failed");
            let _ = writeln!(err, "error: {e}");
            return 1;
        }
    };

    match federation.execute(&sql).await {
        Ok(result) => match write_result(&result, options.stats, &mut out, &mut err) {
            Ok(()) => 0,
            Err(e) => {
                let _ = writeln!(err, "error: {e}");
                1
            }
        },
        Err(e) => {
            let _ = writeln!(err, "error: {e}");
            1
        }
    }
}

fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut iter = args.into_iter();
    let _argv0 = iter.next();
    let mut options = CliOptions::default();

    while let Some(argument) = iter.next() {
        let arg = argument.to_string_lossy();
        match arg.as_ref() {
            "-h" | "--help" => options.show_help = true,
            "--stats" => options.stats = true,
            "-c" | "--config" => {
                if options.config_path.is_some() {
                    return Err(String::from("`--config` may only be provided once"));
                }
                let next = iter
                    .next()
                    .ok_or_else(|| String::from("missing file argument for `--config`"))?;
                options.config_path = Some(next.to_string_lossy().into_owned());
            }
            other => {
                if let Some(value) = other.strip_prefix("--config=") {
                    if options.config_path.is_some() {
                        return Err(String::from("`--config` may only be provided once"));
                    }
                    options.config_path = Some(value.to_owned());
                    continue;
                }
                if other.starts_with('-') && other != "-" {
                    return Err(format!("unknown option `{other}`"));
                }
                if options.sql.is_some() {
                    return Err(String::from("only one SQL statement may be given"));
                }
                // `-` reads the statement from stdin, same as no argument.
                if other != "-" {
                    options.sql = Some(other.to_owned());
                }
            }
        }
    }
    Ok(options)
}

fn write_result<W, E>(result: &FederatedResult, stats: bool, out: &mut W, err: &mut E) -> io::Result<()>
where
    W: Write,
    E: Write,
{
    let body = match &result.geojson {
        Some(collection) => collection.clone(),
        None => serde_json::Value::Array(result.result.to_json_rows()),
    };
    serde_json::to_writer_pretty(&mut *out, &body)?;
    writeln!(out)?;

    if stats {
        serde_json::to_writer_pretty(&mut *err, &result.metadata)?;
        writeln!(err)?;
    }
    Ok(())
}

fn write_usage<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "Usage: geofed [--config <file>] [--stats] [<sql> | -]")?;
    writeln!(out)?;
    writeln!(out, "Runs one SELECT across the configured backend and relational engine.")?;
    writeln!(out, "Without <sql>, the statement is read from stdin. Configuration")?;
    writeln!(out, "comes from GEOFED_* environment variables unless --config is given.")?;
    writeln!(out)?;
    writeln!(out, "Options:")?;
    writeln!(out, "  -c, --config <file>  Load a JSON configuration file")?;
    writeln!(out, "      --stats          Print federation statistics to stderr")?;
    writeln!(out, "  -h, --help           Show this help")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<OsString> {
        std::iter::once("geofed")
            .chain(list.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn sql_and_flags() {
        let options = parse_args(args(&["--stats", "SELECT * FROM parks"])).unwrap();
        assert!(options.stats);
        assert_eq!(options.sql.as_deref(), Some("SELECT * FROM parks"));
        assert_eq!(options.config_path, None);
    }

    #[test]
    fn config_forms() {
        let options = parse_args(args(&["--config", "a.json"])).unwrap();
        assert_eq!(options.config_path.as_deref(), Some("a.json"));
        let options = parse_args(args(&["--config=b.json", "-"])).unwrap();
        assert_eq!(options.config_path.as_deref(), Some("b.json"));
        assert_eq!(options.sql, None);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(args(&["--config"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
        assert!(parse_args(args(&["SELECT 1", "SELECT 2"])).is_err());
    }

    #[test]
    fn usage_mentions_every_option() {
        let mut buffer = Vec::new();
        write_usage(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("--config"));
        assert!(text.contains("--stats"));
    }
}
