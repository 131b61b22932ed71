extern crate libc;
use std::io::Write;

pub fn localtime_r(seconds: i64, tm: &mut libc::tm) {
    let t = seconds as libc::time_t;
    unsafe {
        #[cfg(target_os = "linux")]
        {
            libc::localtime_r(&t, tm);
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::localtime_s(tm, &t);
        }
    }
}

/// Format `nownanos` into `buffer` as "YYYYMMDD-HH:MM:SS[.subsec]" local time.
/// `subsecond_digits` may only be 0, 3, 6 or 9.
pub fn format_time(buffer: &mut [u8], nownanos: i64, subsecond_digits: u32) -> &str {
    debug_assert!(matches!(subsecond_digits, 0 | 3 | 6 | 9));
    debug_assert!(buffer.len() as u32 > 17 + subsecond_digits + 1);
    let (seconds, nanos) = (nownanos / 1_000_000_000, nownanos % 1_000_000_000);
    let mut tm: libc::tm = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
    localtime_r(seconds, &mut tm);
    write!(
        &mut buffer[..],
        "{:04}{:02}{:02}-{:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
    .unwrap();
    let mut n = 17usize;
    if subsecond_digits == 3 {
        write!(&mut buffer[n..], ".{:03}", nanos / 1_000_000).unwrap();
        n += 4;
    } else if subsecond_digits == 6 {
        write!(&mut buffer[n..], ".{:06}", nanos / 1_000).unwrap();
        n += 7;
    } else if subsecond_digits == 9 {
        write!(&mut buffer[n..], ".{:09}", nanos).unwrap();
        n += 10;
    }
    std::str::from_utf8(&buffer[..n]).unwrap()
}

pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

#[macro_export]
macro_rules! logmsg {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos(), 6));
        println!( $( $args ),* );
    }
}

#[macro_export]
/// log only in debug mode.
#[cfg(debug_assertions)]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        let mut buf = [0u8; 40];
        print!("[{}] [DBG] ", $crate::utils::format_time(&mut buf, $crate::utils::now_nanos(), 6));
        println!( $( $args ),* );
    }
}
#[allow(unused_macros)]
#[macro_export]
#[cfg(not(debug_assertions))]
macro_rules! dbglog {
    ($( $args:expr ),*) => {
        ()
    };
}
