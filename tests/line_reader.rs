//! The line reader splits a byte stream into newline-terminated lines,
//! independent of how the reads chunk it.

use std::cell::RefCell;
use std::rc::Rc;

use ringloop::{Buffer, EventLoop, File, StopSignal};

fn pipe_with(payload: &[u8]) -> File {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let written = unsafe { libc::write(fds[1], payload.as_ptr().cast(), payload.len()) };
    assert_eq!(written, payload.len() as isize);
    unsafe { libc::close(fds[1]) };
    File::new(fds[0])
}

#[test]
fn splits_lines_across_read_boundaries() {
    let source = pipe_with(b"a\nbb\nccc\n");

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let lines = Rc::new(RefCell::new(Vec::<String>::new()));
    let collected = lines.clone();
    event_loop
        // A 4-byte buffer forces lines to straddle read completions.
        .read_line_from(source, Buffer::allocate(4), move |ctx, response| {
            collected.borrow_mut().push(response.line.to_string());
            if collected.borrow().len() == 3 {
                ctx.stop.request_stop();
                return false;
            }
            true
        })
        .unwrap();

    event_loop.run(&stop).unwrap();

    assert_eq!(lines.borrow().as_slice(), ["a\n", "bb\n", "ccc\n"]);
    assert_eq!(event_loop.pending_operations(), 0);
    unsafe { libc::close(source.raw()) };
}

#[test]
fn partial_line_is_held_until_its_newline() {
    let source = pipe_with(b"incomplete");

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();
    let dispatcher = event_loop.dispatcher();

    let lines = Rc::new(RefCell::new(Vec::<String>::new()));
    let collected = lines.clone();
    event_loop
        .read_line_from(source, Buffer::allocate(64), move |_ctx, response| {
            collected.borrow_mut().push(response.line.to_string());
            true
        })
        .unwrap();

    // The write end is closed, so the second read completes with zero and
    // retires the operation; stop shortly after.
    let stop_soon = stop.clone();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        dispatcher.dispatch(move |_event_loop| stop_soon.request_stop());
    });

    event_loop.run(&stop).unwrap();

    assert!(lines.borrow().is_empty(), "no newline, no line callback");
    assert_eq!(event_loop.pending_operations(), 0);
    unsafe { libc::close(source.raw()) };
}
