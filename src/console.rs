//! Console output for the VM subsystem
//!
//! Log text lands in a fixed-size ring buffer so recent history survives
//! without touching the heap. The embedding kernel can install a sink
//! (UART, VGA, framebuffer) that receives every string as it is written.

use alloc::vec::Vec;
use core::fmt::{self, Write};
use heapless::HistoryBuffer;
use spin::Mutex;

/// Bytes of log history retained
pub const CONSOLE_BUFFER_SIZE: usize = 4096;

/// Output sink installed by the kernel
pub type ConsoleSink = fn(&str);

/// Console writer interface
pub struct Console {
    history: HistoryBuffer<u8, CONSOLE_BUFFER_SIZE>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            history: HistoryBuffer::new(),
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        self.history.extend_from_slice(s.as_bytes());
        if let Some(sink) = SINK.get() {
            sink(s);
        }
    }

    /// Clear the retained history
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Retained history, oldest byte first
    pub fn snapshot(&self) -> Vec<u8> {
        self.history.oldest_ordered().copied().collect()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

static SINK: spin::Once<ConsoleSink> = spin::Once::new();

/// Install the kernel's output sink (first caller wins)
pub fn set_sink(sink: ConsoleSink) {
    SINK.call_once(|| sink);
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Copy of the retained console history
pub fn snapshot() -> Vec<u8> {
    CONSOLE.lock().snapshot()
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_wraps() {
        let mut console = Console::new();
        console.write_str("hello");
        assert_eq!(console.snapshot(), b"hello");

        for _ in 0..CONSOLE_BUFFER_SIZE {
            console.write_str("x");
        }
        let snap = console.snapshot();
        assert_eq!(snap.len(), CONSOLE_BUFFER_SIZE);
        assert!(snap.iter().all(|&b| b == b'x'));

        console.clear();
        assert!(console.snapshot().is_empty());
    }

    static SUNK: std::sync::Mutex<String> = std::sync::Mutex::new(String::new());

    fn capture(s: &str) {
        SUNK.lock().unwrap_or_else(|e| e.into_inner()).push_str(s);
    }

    #[test]
    fn test_sink_receives_output() {
        set_sink(capture);
        crate::println!("sink-marker-{}", 7);
        let sunk = SUNK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(sunk.contains("sink-marker-7\n"));
    }

    #[test]
    fn test_print_reaches_global_buffer() {
        crate::println!("console-marker-{}", 42);
        let snap = snapshot();
        let text = core::str::from_utf8(&snap).unwrap_or("");
        assert!(text.contains("console-marker-42"));
    }
}
