//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::runner::{CaseDetails, CaseFailure};
use ansi_term::Color::{Blue, Cyan, Green, Red, White};
use ferry::Platform;
use std::time::Duration;

// padding to where PASS/FAIL should start
const PAD_TO_START_OF_LINE: &str = "        ";

fn platform_name(platform: Platform) -> &'static str {
    match platform {
        Platform::SystemV => "sysv",
        Platform::WindowsX64 => "win64",
    }
}

pub fn print_header(cases: usize, platforms: usize) {
    let starting = Green.bold().paint("Starting");
    let name = White.bold().paint("conformance");

    println!(
        "     {starting} '{name}' with {} total runs",
        cases * platforms
    );
}

pub fn print_summary(total: usize, failed: usize, elapsed: Duration) {
    let switching_color = if failed == 0 { Green } else { Red };

    let passed = Green.paint(format!("{}", total - failed));
    let total = Blue.paint(format!("{total}"));
    let failed = switching_color.paint(format!("{failed}"));
    let summary = switching_color.bold().paint("Summary");
    let time = format!("{:11}s", elapsed.as_secs_f32());

    println!("     {summary} [ {time} ] {total} runs, {passed} passed, {failed} failed");
}

fn prettify_diff(expected: &str, got: &str) -> String {
    let mut result = String::from("\n");

    for (line, diff) in diff::lines(got, expected).into_iter().enumerate() {
        result += &format!("{:3} |", line + 1);

        let line = match diff {
            diff::Result::Left(l) => Red.paint(format!("- {l}")).to_string(),
            diff::Result::Both(l, _) => format!("  {l}"),
            diff::Result::Right(r) => Green.paint(format!("+ {r}")).to_string(),
        };

        result += &line;
        result += "\n";
    }

    result
}

fn prettify_failure(failure: &CaseFailure) -> String {
    match failure {
        CaseFailure::Diff { expected, got } => prettify_diff(expected, got),
        CaseFailure::Error(err) => {
            let prefix = Red.bold().paint("case returned an error:");

            format!("{prefix}\n{PAD_TO_START_OF_LINE}{err}")
        }
        CaseFailure::Panic(bt, message) => {
            let msg = Red.bold().paint(message);
            let err = Red.paint("case panicked: ");
            let bt = Red.paint(bt);

            format!("{err}{msg}\n\n{bt}")
        }
    }
}

pub fn print_failure(name: String, error: String) {
    println!("{PAD_TO_START_OF_LINE}- - - - - - - - - - - - - - - - - - - - -");
    println!();
    println!(
        "{}{name}{} {error}",
        Red.paint("output from failure of '"),
        Red.paint("':")
    );
}

pub fn print_case_result(
    name: &'static str,
    platform: Platform,
    details: CaseDetails,
) -> Option<(String, String)> {
    let label = format!(
        "{}/{}",
        Cyan.paint(platform_name(platform)),
        Blue.paint(name)
    );
    let time = format!("{:11}s", details.elapsed.as_secs_f32());

    match &details.output {
        Ok(()) => {
            let status = Green.bold().paint("pass");

            println!("{PAD_TO_START_OF_LINE}{status} [ {time} ] {label}");

            None
        }
        Err(failure) => {
            let status = Red.bold().paint("FAIL");

            println!("{PAD_TO_START_OF_LINE}{status} [ {time} ] {label}");

            Some((label, prettify_failure(failure)))
        }
    }
}
