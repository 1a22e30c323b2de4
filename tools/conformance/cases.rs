//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use ferry::codegen::TemplateId;
use ferry::{ArgType, Descriptor, Engine, Entry, Platform, Result, ReturnType};

const I: ArgType = ArgType::Int;
const F: ArgType = ArgType::Float;

/// What a case expected to see, and what it actually saw.
pub struct Check {
    pub expected: String,
    pub got: String,
}

impl Check {
    fn new(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

pub struct Case {
    pub name: &'static str,
    pub run: fn(&Engine, Platform) -> Result<Check>,
}

pub static CASES: [Case; 11] = [
    Case::new("single-int", single_int),
    Case::new("float-then-int", float_then_int),
    Case::new("ten-ints", ten_ints),
    Case::new("ten-floats", ten_floats),
    Case::new("negative-int", negative_int),
    Case::new("negative-float", negative_float),
    Case::new("int32-result", int32_result),
    Case::new("float32-result", float32_result),
    Case::new("direct-entry", direct_entry),
    Case::new("interposer-only", interposer_only),
    Case::new("call-native", call_native),
];

impl Case {
    const fn new(name: &'static str, run: fn(&Engine, Platform) -> Result<Check>) -> Self {
        Self { name, run }
    }
}

// instantiates a stub for `$desc`, binds it with the pointer type matching
// `$platform` and calls it once
macro_rules! call_stub {
    ($engine:expr, $platform:expr, $desc:expr, fn($($arg:ty),*) -> $ret:ty, ($($val:expr),*)) => {{
        let mut path = $engine.call_path();
        let stub = $engine.instantiate(TemplateId::for_platform($platform), &$desc, &path)?;
        let staged = path.stage(&$desc)?;

        // SAFETY: the stub is called while its descriptor is staged
        unsafe {
            match $platform {
                Platform::SystemV => {
                    staged.bind::<extern "sysv64" fn($($arg),*) -> $ret>(&stub)?($($val),*)
                }
                Platform::WindowsX64 => {
                    staged.bind::<extern "win64" fn($($arg),*) -> $ret>(&stub)?($($val),*)
                }
            }
        }
    }};
}

fn dispatched(
    platform: Platform,
    args: &[ArgType],
    ret: ReturnType,
    extern_index: u64,
    f: ferry::Dispatcher,
) -> Result<Descriptor> {
    Descriptor::new(platform, args, ret, extern_index, Entry::Dispatcher(f))
}

unsafe extern "C" fn times_hundred_plus_one(args: *mut u64, _: u64) -> u64 {
    (*args as i64 * 100 + 1) as u64
}

unsafe extern "C" fn float_times_int(args: *mut u64, extern_index: u64) -> u64 {
    let x = f64::from_bits(*args);
    let n = *args.add(1) as i64;

    (x * n as f64 + extern_index as f64).to_bits()
}

unsafe extern "C" fn sum_ints(args: *mut u64, extern_index: u64) -> u64 {
    let args = std::slice::from_raw_parts(args, extern_index as usize);

    (args.iter().map(|&v| v as i64).sum::<i64>() as f64).to_bits()
}

// reads the arguments as decimal digits, least significant first
unsafe extern "C" fn float_digits(args: *mut u64, extern_index: u64) -> u64 {
    let args = std::slice::from_raw_parts(args, extern_index as usize);

    args.iter()
        .rev()
        .fold(0.0, |acc, &v| acc * 10.0 + f64::from_bits(v))
        .to_bits()
}

unsafe extern "C" fn minus_eighty_three(_: *mut u64, _: u64) -> u64 {
    (-83i64) as u64
}

unsafe extern "C" fn minus_eight_point_three(_: *mut u64, _: u64) -> u64 {
    (-8.3f64).to_bits()
}

unsafe extern "C" fn dirty_int32(args: *mut u64, _: u64) -> u64 {
    0xffff_ffff_0000_0000 | (*args as i32 as u32 as u64)
}

unsafe extern "C" fn halve_f32(args: *mut u64, _: u64) -> u64 {
    let x = f32::from_bits(*args as u32);

    0xdead_beef_0000_0000 | (x / 2.0).to_bits() as u64
}

extern "sysv64" fn mix_sysv(a: i64, x: f64, b: i64, y: f64, c: i64) -> f64 {
    (a + b + c) as f64 * 10000.0 + x + y
}

extern "win64" fn mix_win64(a: i64, x: f64, b: i64, y: f64, c: i64) -> f64 {
    (a + b + c) as f64 * 10000.0 + x + y
}

fn mix_address(platform: Platform) -> usize {
    match platform {
        Platform::SystemV => mix_sysv as *const () as usize,
        Platform::WindowsX64 => mix_win64 as *const () as usize,
    }
}

fn single_int(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[I], ReturnType::Int64, 0, times_hundred_plus_one)?;
    let first = call_stub!(engine, platform, desc, fn(i64) -> i64, (42));
    let second = call_stub!(engine, platform, desc, fn(i64) -> i64, (83));

    Ok(Check::new("4201\n8301", format!("{first}\n{second}")))
}

fn float_then_int(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[F, I], ReturnType::Float64, 1, float_times_int)?;
    let got = call_stub!(engine, platform, desc, fn(f64, i64) -> f64, (1.5, 4));

    Ok(Check::new("7", format!("{got}")))
}

fn ten_ints(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[I; 10], ReturnType::Float64, 10, sum_ints)?;
    let got = call_stub!(
        engine,
        platform,
        desc,
        fn(i64, i64, i64, i64, i64, i64, i64, i64, i64, i64) -> f64,
        (41, 42, 43, 44, 45, 46, 47, 48, 49, 50)
    );

    Ok(Check::new("455", format!("{got}")))
}

fn ten_floats(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[F; 10], ReturnType::Float64, 10, float_digits)?;
    let got = call_stub!(
        engine,
        platform,
        desc,
        fn(f64, f64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64,
        (0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0)
    );

    Ok(Check::new("9876543210", format!("{got}")))
}

fn negative_int(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[], ReturnType::Int64, 0, minus_eighty_three)?;
    let got = call_stub!(engine, platform, desc, fn() -> i64, ());

    Ok(Check::new("-83", format!("{got}")))
}

fn negative_float(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(
        platform,
        &[],
        ReturnType::Float64,
        0,
        minus_eight_point_three,
    )?;
    let got = call_stub!(engine, platform, desc, fn() -> f64, ());

    Ok(Check::new(
        format!("{:#x}", (-8.3f64).to_bits()),
        format!("{:#x}", got.to_bits()),
    ))
}

fn int32_result(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[I], ReturnType::Int32, 0, dirty_int32)?;
    let got = call_stub!(engine, platform, desc, fn(i64) -> i64, (-7));

    Ok(Check::new("-7", format!("{got}")))
}

fn float32_result(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[F], ReturnType::Float32, 0, halve_f32)?;
    let got = call_stub!(engine, platform, desc, fn(f32) -> f32, (3.0));

    Ok(Check::new("1.5", format!("{got}")))
}

fn direct_entry(engine: &Engine, platform: Platform) -> Result<Check> {
    let entry = Entry::Direct(mix_address(platform));
    let desc = Descriptor::new(platform, &[I, F, I, F, I], ReturnType::Float64, 0, entry)?;
    let got = call_stub!(
        engine,
        platform,
        desc,
        fn(i64, f64, i64, f64, i64) -> f64,
        (1, 0.25, 2, 0.5, 2)
    );

    Ok(Check::new("50000.75", format!("{got}")))
}

fn interposer_only(engine: &Engine, platform: Platform) -> Result<Check> {
    let desc = dispatched(platform, &[F, I], ReturnType::Float64, 2, float_times_int)?;
    let mut path = engine.call_path();
    let staged = path.stage(&desc)?;

    type Sysv = extern "sysv64" fn(f64, i64) -> f64;
    type Win = extern "win64" fn(f64, i64) -> f64;

    // SAFETY: the routine is called while its descriptor is staged
    let got = unsafe {
        match platform {
            Platform::SystemV => staged.bind_interposer::<Sysv>()?(0.5, 8),
            Platform::WindowsX64 => staged.bind_interposer::<Win>()?(0.5, 8),
        }
    };

    Ok(Check::new("6", format!("{got}")))
}

fn call_native(engine: &Engine, platform: Platform) -> Result<Check> {
    let entry = Entry::Direct(0);
    let desc = Descriptor::new(platform, &[I, F, I, F, I], ReturnType::Float64, 0, entry)?;
    let args = [3, 0.5f64.to_bits(), 4, 0.25f64.to_bits(), 5];

    // SAFETY: the target has exactly the described signature
    let raw = unsafe { engine.call_native(&desc, mix_address(platform), &args)? };

    Ok(Check::new("120000.75", format!("{}", f64::from_bits(raw))))
}
