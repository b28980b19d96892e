//! File operations: open/write/read chains, stat, and pooled prints.

use std::cell::RefCell;
use std::rc::Rc;

use ringloop::{Buffer, EventLoop, StopSignal};

#[test]
fn open_write_read_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("output.txt");

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let read_back: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let collected = read_back.clone();
    let reopen_path = path.clone();
    event_loop
        .open_file_with(
            &path,
            libc::O_CREAT | libc::O_RDWR,
            0o600,
            move |ctx, response| {
                assert!(response.file.is_valid());
                let payload = Buffer::from_bytes(b"Hello, World, all my friends!");

                let collected = collected.clone();
                let reopen_path = reopen_path.clone();
                ctx.event_loop
                    .write_file(response.file, payload, move |ctx, response| {
                        assert_eq!(response.size, 29);
                        ctx.event_loop.close(response.file, |_ctx, _r| {}).unwrap();

                        let collected = collected.clone();
                        ctx.event_loop
                            .open_file(&reopen_path, move |ctx, response| {
                                assert!(response.file.is_valid());

                                // Small buffer so the read resubmits and the
                                // offset advances across completions.
                                let collected = collected.clone();
                                ctx.event_loop
                                    .read_file(
                                        response.file,
                                        Buffer::allocate(8),
                                        0,
                                        move |ctx, response| {
                                            collected
                                                .borrow_mut()
                                                .extend_from_slice(response.data);
                                            if response.data.is_empty() {
                                                ctx.stop.request_stop();
                                                false
                                            } else {
                                                true
                                            }
                                        },
                                    )
                                    .unwrap();
                            })
                            .unwrap();
                    })
                    .unwrap();
            },
        )
        .unwrap();

    event_loop.run(&stop).unwrap();
    assert_eq!(
        read_back.borrow().as_slice(),
        b"Hello, World, all my friends!"
    );
}

#[test]
fn stat_reports_size_then_error_for_missing_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fodder.txt");
    std::fs::write(&path, b"some stat fodder").unwrap();

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    let seen_size = Rc::new(RefCell::new(None::<u64>));
    let seen_error = Rc::new(RefCell::new(None::<String>));

    let size_slot = seen_size.clone();
    let error_slot = seen_error.clone();
    event_loop
        .stat_file(&path, move |ctx, response| {
            let stats = response.stats.expect("stats present for existing file");
            assert!(stats.is_file());
            *size_slot.borrow_mut() = Some(stats.size());

            let error_slot = error_slot.clone();
            ctx.event_loop
                .stat_file("/no/such/path/at/all", move |ctx, response| {
                    assert!(response.stats.is_none());
                    *error_slot.borrow_mut() = ctx.error();
                    ctx.stop.request_stop();
                })
                .unwrap();
        })
        .unwrap();

    event_loop.run(&stop).unwrap();

    assert_eq!(*seen_size.borrow(), Some(16));
    let error = seen_error.borrow().clone().expect("error for missing path");
    assert!(!error.is_empty());
}

#[test]
fn open_failure_delivers_invalid_descriptor() {
    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    event_loop
        .open_file("/no/such/file/anywhere", move |ctx, response| {
            assert!(!response.file.is_valid());
            assert!(ctx.error().is_some());
            ctx.stop.request_stop();
        })
        .unwrap();

    event_loop.run(&stop).unwrap();
    assert_eq!(event_loop.pending_operations(), 0);
}

#[test]
fn print_file_writes_through_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("printed.txt");

    let mut event_loop = EventLoop::new().unwrap();
    let stop = StopSignal::new();

    event_loop
        .open_file_with(
            &path,
            libc::O_CREAT | libc::O_WRONLY,
            0o600,
            move |ctx, response| {
                assert!(response.file.is_valid());
                ctx.event_loop
                    .print_file(response.file, "printed line\n", |ctx, response| {
                        assert_eq!(response.size, 13);
                        ctx.stop.request_stop();
                    })
                    .unwrap();
            },
        )
        .unwrap();

    event_loop.run(&stop).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "printed line\n"
    );
}
