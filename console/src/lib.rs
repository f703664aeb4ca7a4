//! kernel-console: 提供可定制实现的 `print!`、`println!` 与 `log::Log`

#![no_std]

pub extern crate log;

use core::fmt;
use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

/// 控制台输出抽象。实现者提供逐字节输出；
/// 默认的 `put_str` 逐字节调用 `put_char`。
pub trait Console: Sync {
    fn put_char(&self, c: u8);

    fn put_str(&self, s: &str) {
        for byte in s.bytes() {
            self.put_char(byte);
        }
    }
}

static CONSOLE: Once<&'static dyn Console> = Once::new();

/// 设置全局控制台并注册 logger。重复调用忽略。
pub fn init_console(console: &'static dyn Console) {
    CONSOLE.call_once(|| console);
    let _ = log::set_logger(&Logger);
}

/// 按名称设置全局日志级别；`None` 或无法识别时为 `Trace`。
pub fn set_log_level(env: Option<&str>) {
    let level = match env {
        Some("off") | Some("OFF") => LevelFilter::Off,
        Some("error") | Some("ERROR") => LevelFilter::Error,
        Some("warn") | Some("WARN") => LevelFilter::Warn,
        Some("info") | Some("INFO") => LevelFilter::Info,
        Some("debug") | Some("DEBUG") => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_max_level(level);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let console = *CONSOLE.get().expect("console not initialized");
    let mut writer = ConsoleWriter { console };
    fmt::write(&mut writer, args).unwrap();
}

struct ConsoleWriter {
    console: &'static dyn Console,
}

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.put_str(s);
        Ok(())
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::_print(core::format_args!($($arg)*));
        $crate::print!("\n");
    }};
}

struct Logger;

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let color = match record.level() {
            Level::Error => 31,
            Level::Warn => 93,
            Level::Info => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        println!(
            "\x1b[{}m[{:>5}] {}\x1b[0m",
            color,
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}
