// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Command-line entry point.

use std::process::ExitCode;

use clap::{error::ErrorKind, CommandFactory, Parser};

use s3fleet::commands::{self, validate_endpoint_url, Cli};
use s3fleet::config::ReportMode;
use s3fleet::logging;

fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            // Usage errors go to stderr without the full help listing.
            eprint!("{e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = parse_args();
    let global = commands::global_options(&cli.global);

    logging::init(global.log_level, None);

    if let Some(endpoint) = &global.endpoint_url {
        if let Err(e) = validate_endpoint_url(endpoint) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let request = match commands::build_request(cli.command) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let report_mode = global.report_mode;
    let ctx = commands::Context::new(global);
    ctx.cancel.cancel_on_signal();

    let errors = commands::dispatch(&ctx, request).await;
    commands::report_errors(&errors);
    if !matches!(report_mode, ReportMode::Silent) {
        commands::report_stats(report_mode, ctx.engine.stats());
    }

    let exit_code = if errors.is_empty() { 0 } else { 1 };
    eprintln!("# Exiting with code {exit_code}");
    ExitCode::from(exit_code)
}

#[test]
fn verify_clap() {
    Cli::command().debug_assert();
}
