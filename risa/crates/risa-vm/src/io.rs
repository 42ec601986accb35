//! Host I/O indirection.
//!
//! The VM never touches process stdio directly; every read and write goes
//! through these handlers so embedders (and tests) can capture or redirect
//! them. Cloning shares the underlying handlers.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

/// Input handler: returns one byte, or [`IO_EOF`] on end of input/error.
pub type InHandler = Rc<dyn Fn() -> u16>;

/// Output handler for stdout/stderr-style sinks.
pub type OutHandler = Rc<dyn Fn(&str)>;

/// Returned by the input handler when no byte is available.
pub const IO_EOF: u16 = u16::MAX;

#[derive(Clone)]
pub struct RisaIo {
    pub input: InHandler,
    pub out: OutHandler,
    pub err: OutHandler,
}

impl Default for RisaIo {
    fn default() -> Self {
        Self {
            input: Rc::new(|| {
                let mut byte = [0u8; 1];
                match std::io::stdin().read(&mut byte) {
                    Ok(1) => u16::from(byte[0]),
                    _ => IO_EOF,
                }
            }),
            out: Rc::new(|data| {
                print!("{}", data);
                let _ = std::io::stdout().flush();
            }),
            err: Rc::new(|data| {
                eprint!("{}", data);
            }),
        }
    }
}

impl RisaIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> u16 {
        (self.input)()
    }

    pub fn out(&self, data: &str) {
        (self.out)(data);
    }

    pub fn err(&self, data: &str) {
        (self.err)(data);
    }

    /// An I/O block whose output lands in shared buffers; input always
    /// reports EOF. Used by tests and the REPL's capture mode.
    pub fn capture() -> (Self, Rc<RefCell<String>>, Rc<RefCell<String>>) {
        let out_buffer = Rc::new(RefCell::new(String::new()));
        let err_buffer = Rc::new(RefCell::new(String::new()));

        let out_sink = Rc::clone(&out_buffer);
        let err_sink = Rc::clone(&err_buffer);

        let io = Self {
            input: Rc::new(|| IO_EOF),
            out: Rc::new(move |data| out_sink.borrow_mut().push_str(data)),
            err: Rc::new(move |data| err_sink.borrow_mut().push_str(data)),
        };

        (io, out_buffer, err_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_collects_output() {
        let (io, out, err) = RisaIo::capture();

        io.out("hello ");
        io.out("world");
        io.err("oops");

        assert_eq!(*out.borrow(), "hello world");
        assert_eq!(*err.borrow(), "oops");
    }

    #[test]
    fn test_capture_input_is_eof() {
        let (io, _, _) = RisaIo::capture();
        assert_eq!(io.read(), IO_EOF);
    }

    #[test]
    fn test_clone_shares_handlers() {
        let (io, out, _) = RisaIo::capture();
        let clone = io.clone();

        clone.out("via clone");
        assert_eq!(*out.borrow(), "via clone");
    }
}
