//! Option handling shared by the two transfer executables.

use clap::{App, Arg, ArgMatches};
use freighter::config::{Config, CpuRange, Params};
use std::fs;

/// Adds the flags both personalities accept.
pub fn common_args<'a, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
    app.arg(
        Arg::with_name("nsessions")
            .short("n")
            .takes_value(true)
            .help("Number of parallel sessions"),
    )
    .arg(
        Arg::with_name("processors")
            .short("p")
            .takes_value(true)
            .help("CPU range 'i - j' associated with the workers"),
    )
    .arg(
        Arg::with_name("cancel")
            .short("c")
            .help("Expect cancellation; the exit code reflects it"),
    )
    .arg(
        Arg::with_name("reregister")
            .short("r")
            .help("Register payload buffers per transfer"),
    )
    .arg(
        Arg::with_name("waitfd")
            .short("w")
            .help("Use wait objects for worker readiness"),
    )
    .arg(
        Arg::with_name("config")
            .short("f")
            .takes_value(true)
            .help("Path to a JSON config file"),
    )
}

/// Builds run parameters: defaults, then the config file, then explicit
/// flags on top.
pub fn params_from_matches(matches: &ArgMatches) -> Result<Params, String> {
    let mut params = Params::new();

    if let Some(path) = matches.value_of("config") {
        let file =
            fs::File::open(path).map_err(|e| format!("error opening config file: {}", e))?;
        let config: Config =
            serde_json::from_reader(file).map_err(|e| format!("error parsing config file: {}", e))?;

        params.apply(&config);
    }

    if let Some(n) = matches.value_of("nsessions") {
        let n: usize = n
            .parse()
            .map_err(|_| format!("could not parse `-n` parameter `{}`", n))?;

        if n < 1 {
            return Err(format!("`-n` parameter `{}` is out of range", n));
        }

        params.nsessions = n;
    }

    if let Some(range) = matches.value_of("processors") {
        params.processors = parse_cpu_range(range)?;
    }

    if matches.is_present("cancel") {
        params.expect_cancellation = true;
    }
    if matches.is_present("contiguous") {
        params.contiguous = true;
    }
    if matches.is_present("reregister") {
        params.reregister = true;
    }
    if matches.is_present("waitfd") {
        params.waitfd = true;
    }

    Ok(params)
}

fn parse_cpu_range(range: &str) -> Result<CpuRange, String> {
    let err = || format!("unexpected `-p` parameter `{}`", range);
    let mut parts = range.splitn(2, '-');

    let first = parts
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(err)?;
    let last = parts
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(err)?;

    if last < first {
        return Err(err());
    }

    Ok(CpuRange { first, last })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_range_formats() {
        assert_eq!(
            parse_cpu_range("2 - 5").unwrap(),
            CpuRange { first: 2, last: 5 }
        );
        assert_eq!(
            parse_cpu_range("0-0").unwrap(),
            CpuRange { first: 0, last: 0 }
        );
        assert!(parse_cpu_range("5 - 2").is_err());
        assert!(parse_cpu_range("x - y").is_err());
        assert!(parse_cpu_range("3").is_err());
    }
}
