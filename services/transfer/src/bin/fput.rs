use clap::{App, Arg};
use freighter::fabric::Domain;
use freighter::{logging, put};
use std::process;
use std::sync::Arc;
use transfer::{opts, signals};

pub fn main() {
    let matches = opts::common_args(
        App::new("fput")
            .version("1.0")
            .about("Produces and writes a bulk transfer.")
            .arg(
                Arg::with_name("contiguous")
                    .short("g")
                    .help("Force contiguous RMA: one remote segment per write"),
            )
            .arg(
                Arg::with_name("ADDR")
                    .help("Destination address")
                    .required(true),
            ),
    )
    .get_matches();

    let params = match opts::params_from_matches(&matches) {
        Ok(params) => Arc::new(params),
        Err(err) => {
            eprintln!("fput: {}", err);
            process::exit(2);
        }
    };

    let logger = logging::init();

    signals::install(&params.cancel);

    let dest = matches.value_of("ADDR").expect("ADDR is required");
    let domain = Domain::new();

    let code = match put::run(&domain, dest, &params, &logger) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            logging::error!(logger, "transfer failed"; "err" => ?err);
            1
        }
    };

    process::exit(code);
}
