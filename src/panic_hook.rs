//! Panic Hook 模块
//!
//! 进程 panic 时把崩溃报告追加到 `~/.agent-bridge/crash.log`，并输出到 stderr。

use crate::config::app_dir;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn crash_log_path() -> PathBuf {
    app_dir().join("crash.log")
}

/// 单次崩溃的报告内容
struct CrashReport {
    timestamp: String,
    message: String,
    location: String,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| info.to_string());

        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            timestamp: timestamp(),
            message,
            location,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    fn render(&self) -> String {
        let separator = "=".repeat(72);
        format!(
            "\n{separator}\n[CRASH] {} agent-bridge {APP_VERSION}\n{separator}\n{}\nMessage: {}\nLocation: {}\n\nBacktrace:\n{}\n{separator}\n",
            self.timestamp,
            system_info(),
            self.message,
            self.location,
            self.backtrace,
        )
    }
}

/// chrono 格式化失败时退回 unix 时间戳，避免在 hook 内再次 panic
fn timestamp() -> String {
    panic::catch_unwind(|| chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|_| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| format!("unix:{}", d.as_secs()))
                .unwrap_or_else(|_| "unknown".to_string())
        })
}

fn system_info() -> String {
    let thread = std::thread::current();
    format!(
        "OS: {} ({})\nArch: {}\nThread: {}",
        std::env::consts::OS,
        std::env::consts::FAMILY,
        std::env::consts::ARCH,
        thread.name().unwrap_or("unnamed"),
    )
}

fn append_report(path: &Path, report: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(report.as_bytes())?;
    file.flush()
}

/// 安装 panic hook（保留默认 hook 的输出）
pub fn setup_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let report = CrashReport::capture(info).render();
        let path = crash_log_path();
        if append_report(&path, &report).is_ok() {
            eprintln!("\n[agent-bridge] Crash log saved to: {}", path.display());
        }
        eprintln!("{report}");
        default_hook(info);
    }));
}
