use clap::{App, Arg};
use freighter::fabric::Domain;
use freighter::{get, logging, SERVICE_NAME};
use std::process;
use std::sync::Arc;
use transfer::{opts, signals};

pub fn main() {
    let matches = opts::common_args(
        App::new("fget")
            .version("1.0")
            .about("Receives and verifies a bulk transfer.")
            .arg(
                Arg::with_name("bind")
                    .short("b")
                    .takes_value(true)
                    .help("Bind address"),
            ),
    )
    .get_matches();

    let params = match opts::params_from_matches(&matches) {
        Ok(params) => Arc::new(params),
        Err(err) => {
            eprintln!("fget: {}", err);
            process::exit(2);
        }
    };

    let logger = logging::init();

    signals::install(&params.cancel);

    let bind = matches.value_of("bind").unwrap_or(SERVICE_NAME);
    let domain = Domain::new();

    let code = match get::run(&domain, bind, &params, &logger) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            logging::error!(logger, "transfer failed"; "err" => ?err);
            1
        }
    };

    process::exit(code);
}
