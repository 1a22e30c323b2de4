//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Contains utility code specifically for the CLI tools located in
//! the `tools/` subdirectory.
//!
//! Every tool takes the same basic options and reports log output the same way,
//! so that code lives here and the drivers only add what is specific to them.

use crate::abi::Platform;
use ansi_term::Color::{Blue, Cyan, Red, White, Yellow};
use bpaf::{construct, OptionParser, Parser};
use log::{Level, LevelFilter, Log, Metadata, Record};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Basic options that every CLI tool in the suite takes in.
pub struct BaseOptions {
    /// Whether or not to run the logging in verbose mode.
    pub verbose: bool,
    /// How many worker threads to use, if the tool cares
    pub jobs: Option<usize>,
}

/// Returns a [`OptionParser`] preconfigured with the standard options and
/// additional tool-specific options.
pub fn tool_with<T>(
    description: &'static str,
    usage: &'static str,
    additional: impl Parser<T> + 'static,
) -> OptionParser<(T, BaseOptions)> {
    let res = construct!(additional, default());

    res.to_options()
        .descr(description)
        .version(VERSION)
        .usage(usage)
}

/// Gets the baseline default options that every tool needs.
pub fn default() -> impl Parser<BaseOptions> {
    let verbose = verbose();
    let jobs = jobs();

    construct!(BaseOptions { verbose, jobs })
}

/// Checks for the presence of `-v` or `--verbose`
pub fn verbose() -> impl Parser<bool> {
    bpaf::long("verbose")
        .short('v')
        .help("enable verbose output")
        .flag(true, false)
}

/// Gets the number of concurrent threads to use for a given task
pub fn jobs() -> impl Parser<Option<usize>> {
    bpaf::long("jobs")
        .short('j')
        .help("the number of concurrent jobs to run cases on")
        .argument::<usize>("JOBS")
        .optional()
}

/// Restricts a tool to one calling convention, either 'sysv' or 'win64'
pub fn platform() -> impl Parser<Option<Platform>> {
    bpaf::long("platform")
        .short('p')
        .help("only use one calling convention, either 'sysv' or 'win64'")
        .argument::<String>("PLATFORM")
        .guard(
            |p| p == "sysv" || p == "win64",
            "platform must be one of 'sysv', 'win64'",
        )
        .map(|p| match p.as_str() {
            "sysv" => Platform::SystemV,
            _ => Platform::WindowsX64,
        })
        .optional()
}

struct ToolLogger {
    level: LevelFilter,
}

impl Log for ToolLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            Level::Error => Red.bold().paint("error"),
            Level::Warn => Yellow.bold().paint("warn"),
            Level::Info => White.bold().paint("info"),
            Level::Debug => Blue.paint("debug"),
            Level::Trace => Cyan.paint("trace"),
        };

        eprintln!("{level}: {}", record.args());
    }

    fn flush(&self) {}
}

/// Installs a logger that writes to stderr, `info` and up unless `verbose` is set.
///
/// Installing twice is harmless, the first logger wins.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };

    let logger: &'static ToolLogger = Box::leak(Box::new(ToolLogger { level }));

    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_and_jobs() {
        let parser = tool_with("test", "test", platform());
        let (platform, options) = parser
            .run_inner(&["--platform", "win64", "-j", "3"])
            .unwrap();

        assert_eq!(platform, Some(Platform::WindowsX64));
        assert_eq!(options.jobs, Some(3));
        assert!(!options.verbose);
    }

    #[test]
    fn rejects_unknown_platform() {
        let parser = tool_with("test", "test", platform());

        assert!(parser.run_inner(&["--platform", "arm"]).is_err());
    }
}
