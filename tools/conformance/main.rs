//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

#[cfg(target_arch = "x86_64")]
mod cases;
#[cfg(target_arch = "x86_64")]
mod display;
#[cfg(target_arch = "x86_64")]
mod runner;

#[cfg(target_arch = "x86_64")]
use crate::runner::run;
#[cfg(target_arch = "x86_64")]
use bpaf::Parser;
#[cfg(target_arch = "x86_64")]
use ferry::cli;
use std::process::ExitCode;

#[cfg(target_arch = "x86_64")]
fn case() -> impl Parser<Option<String>> {
    bpaf::long("case")
        .short('c')
        .help("the case to run, runs every case if not given")
        .argument::<String>("NAME")
        .optional()
}

#[cfg(target_arch = "x86_64")]
fn main() -> ExitCode {
    #[cfg(windows)]
    ansi_term::enable_ansi_support().expect("unable to enable ANSI");

    let case = case();
    let platform = cli::platform();
    let ((case, platform), options) = cli::tool_with(
        "runs generated trampolines against known-good results",
        "conformance [--case <NAME>] [--platform <PLATFORM>]",
        bpaf::construct!(case, platform),
    )
    .run();

    cli::init_logging(options.verbose);
    runner::install_panic_hook();

    match run(case.as_deref(), platform, options.jobs) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");

            ExitCode::from(1)
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn main() -> ExitCode {
    eprintln!("conformance: trampolines can only be generated on x86-64 hosts");

    ExitCode::from(1)
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_all_cases() {
    runner::install_panic_hook();

    assert!(matches!(run(None, None, Some(2)), Ok(())));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_unknown_case() {
    assert!(run(Some("no-such-case"), None, Some(1)).is_err());
}
