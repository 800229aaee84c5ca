use std::cell::RefCell;
use std::collections::VecDeque;

use cranelift_jit::JITBuilder;

// JIT-compiled code runs on the calling thread, so per-thread buffers keep
// concurrently-running tests from interfering with each other.
thread_local! {
    static INPUT: RefCell<VecDeque<u8>> = RefCell::new(VecDeque::new());
    static OUTPUT: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

/// Queue bytes for the char-input builtin of JIT-compiled code on this thread.
pub fn push_input(bytes: &[u8]) {
    INPUT.with(|input| input.borrow_mut().extend(bytes.iter().copied()));
}

/// Drain everything the char-output builtin wrote on this thread.
pub fn take_output() -> Vec<u8> {
    OUTPUT.with(|output| std::mem::take(&mut *output.borrow_mut()))
}

extern "C" fn builtin_getchar() -> i8 {
    INPUT
        .with(|input| input.borrow_mut().pop_front())
        .map(|byte| byte as i8)
        .unwrap_or(-1)
}

extern "C" fn builtin_putchar(value: i32) {
    OUTPUT.with(|output| output.borrow_mut().push(value as u8));
}

/// Bind the builtin names to their in-process implementations.
pub fn register_builtin_symbols(builder: &mut JITBuilder) {
    builder.symbol("getchar", builtin_getchar as *const u8);
    builder.symbol("putchar", builtin_putchar as *const u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getchar_drains_queued_input_then_reports_eof() {
        push_input(b"ab");
        assert_eq!(builtin_getchar(), b'a' as i8);
        assert_eq!(builtin_getchar(), b'b' as i8);
        assert_eq!(builtin_getchar(), -1);
    }

    #[test]
    fn putchar_appends_to_output() {
        builtin_putchar(72);
        builtin_putchar(105);
        assert_eq!(take_output(), b"Hi");
    }
}
