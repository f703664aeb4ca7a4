//! kernel-console crate 功能性验证测试
//!
//! 用一个把输出累积到内存的 Console 实现验证打印与日志格式。
//! 全局控制台只能注册一次，所有断言共用同一个 sink。

use kernel_console::{print, println, Console};
use std::sync::Mutex;

struct SinkConsole;

static SINK: Mutex<Vec<u8>> = Mutex::new(Vec::new());

impl Console for SinkConsole {
    fn put_char(&self, c: u8) {
        SINK.lock().unwrap().push(c);
    }
}

static CONSOLE: SinkConsole = SinkConsole;

fn taken() -> String {
    let mut sink = SINK.lock().unwrap();
    let s = String::from_utf8(sink.clone()).unwrap();
    sink.clear();
    s
}

#[test]
fn test_print_and_log() {
    kernel_console::init_console(&CONSOLE);
    kernel_console::set_log_level(Some("info"));

    taken();
    print!("hello {}", 42);
    assert_eq!(taken(), "hello 42");

    println!("line");
    assert_eq!(taken(), "line\n");

    println!();
    assert_eq!(taken(), "\n");

    // info 级别可见，带级别标签
    log::info!("boot");
    let out = taken();
    assert!(out.contains("INFO"));
    assert!(out.contains("boot"));

    // debug 低于当前级别，被过滤
    log::debug!("invisible");
    assert_eq!(taken(), "");

    // error 可见且着色
    log::error!("bad");
    let out = taken();
    assert!(out.contains("ERROR"));
    assert!(out.contains("\x1b[31m"));
}
