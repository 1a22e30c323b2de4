//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::cases::{Case, CASES};
use crate::display;
use backtrace::Backtrace;
use ferry::{Engine, Platform};
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Once};
use std::time::{Duration, Instant};
use threadpool::ThreadPool;

thread_local! {
    static BACKTRACE: RefCell<Option<Backtrace>> = RefCell::new(None);
}

const PLATFORMS: [Platform; 2] = [Platform::SystemV, Platform::WindowsX64];

/// Why a single case did not pass.
pub enum CaseFailure {
    Diff { expected: String, got: String },
    Error(String),
    Panic(String, String),
}

pub struct CaseDetails {
    pub elapsed: Duration,
    pub output: Result<(), CaseFailure>,
}

/// Records a backtrace for every panic so a failing case can show where it died.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        panic::set_hook(Box::new(|_| {
            BACKTRACE.with(|b| *b.borrow_mut() = Some(Backtrace::new()));
        }))
    });
}

fn pool_for_jobs(jobs: Option<usize>) -> ThreadPool {
    match jobs {
        Some(n) => ThreadPool::new(n.max(1)),
        None => ThreadPool::default(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic payload>".to_string()
    }
}

fn run_case(engine: &Engine, case: &Case, platform: Platform) -> CaseDetails {
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| (case.run)(engine, platform)));
    let output = match result {
        Ok(Ok(check)) if check.expected == check.got => Ok(()),
        Ok(Ok(check)) => Err(CaseFailure::Diff {
            expected: check.expected,
            got: check.got,
        }),
        Ok(Err(e)) => Err(CaseFailure::Error(e.to_string())),
        Err(payload) => {
            let bt = BACKTRACE
                .with(|b| b.borrow_mut().take())
                .map(|b| format!("{b:#?}"))
                .unwrap_or_default();

            Err(CaseFailure::Panic(bt, panic_message(payload.as_ref())))
        }
    };

    CaseDetails {
        elapsed: start.elapsed(),
        output,
    }
}

fn run_cases(cases: &[&'static Case], platforms: &[Platform], pool: &ThreadPool) -> io::Result<()> {
    let engine = Arc::new(Engine::new());
    let (send, recv) = mpsc::channel();
    let mut total = 0usize;
    let mut total_time = Duration::default();
    let mut failed = Vec::default();

    display::print_header(cases.len(), platforms.len());

    for &case in cases {
        for &platform in platforms {
            let send = send.clone();
            let engine = Arc::clone(&engine);

            pool.execute(move || {
                let details = run_case(&engine, case, platform);

                // the receiver outlives every job
                let _ = send.send((case.name, platform, details));
            });
        }
    }

    drop(send);

    for (name, platform, details) in recv {
        total += 1;
        total_time += details.elapsed;

        if let Some(rest) = display::print_case_result(name, platform, details) {
            failed.push(rest);
        }
    }

    display::print_summary(total, failed.len(), total_time);

    match failed.len() {
        0 => Ok(()),
        n => {
            for (name, rest) in failed {
                display::print_failure(name, rest);
            }

            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{n} conformance cases failed"),
            ))
        }
    }
}

/// Runs every case (or only `case`), on both conventions (or only `platform`).
pub fn run(case: Option<&str>, platform: Option<Platform>, jobs: Option<usize>) -> io::Result<()> {
    let pool = pool_for_jobs(jobs);
    let cases: Vec<&'static Case> = match case {
        Some(name) => CASES.iter().filter(|c| c.name == name).collect(),
        None => CASES.iter().collect(),
    };

    if cases.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no case named '{}'", case.unwrap_or_default()),
        ));
    }

    let platforms = match platform {
        Some(p) => vec![p],
        None => PLATFORMS.to_vec(),
    };

    run_cases(&cases, &platforms, &pool)
}
