//! Toy debuggee with a watchable exported global
//!
//! Performs a fixed number of read-increment-write rounds on the counter
//! and exits with a recognizable code so launcher exit-code passthrough
//! can be asserted end to end. Volatile accesses keep the loads and
//! stores in the binary.

/// Number of increments the watcher should observe as writes.
const ROUNDS: i64 = 64;

/// Exit code asserted by the end-to-end tests.
const EXIT_CODE: i32 = 123;

#[no_mangle]
pub static mut WATCH_COUNTER: i64 = 0;

fn main() {
    for _ in 0..ROUNDS {
        unsafe {
            let value = std::ptr::read_volatile(std::ptr::addr_of!(WATCH_COUNTER));
            std::ptr::write_volatile(std::ptr::addr_of_mut!(WATCH_COUNTER), value + 1);
        }
    }

    let final_value = unsafe { std::ptr::read_volatile(std::ptr::addr_of!(WATCH_COUNTER)) };
    if final_value != ROUNDS {
        eprintln!("unexpected final counter value: {final_value}");
        std::process::exit(1);
    }

    std::process::exit(EXIT_CODE);
}
