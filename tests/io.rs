use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use fibrio::coio::{self, CoIOListener, CoIOStream};
use fibrio::fiber::Runtime;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    coio::fd_nonblock(fds[0]).unwrap();
    coio::fd_nonblock(fds[1]).unwrap();
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn read_write_over_a_pipe() {
    init_log();
    let rt = Runtime::new().unwrap();
    let (rfd, wfd) = pipe();

    let reader = rt
        .create("reader", move |rt| {
            let mut buf = [0u8; 10];
            let mut count = 0;
            loop {
                let n = coio::read(rt, rfd, &mut buf).unwrap();
                if n == 0 {
                    assert_eq!(count, 1000);
                    return;
                }
                count += n;
            }
        })
        .unwrap();
    let writer = rt
        .create("writer", move |rt| {
            let buf = [0u8; 100];
            for _ in 0..10 {
                let n = coio::write(rt, wfd, &buf).unwrap();
                assert_eq!(n, buf.len());
            }
            close(wfd);
        })
        .unwrap();

    rt.transfer(reader).unwrap();
    rt.transfer(writer).unwrap();
    rt.run();

    assert!(rt.is_reclaimed(reader));
    assert!(rt.is_reclaimed(writer));
    close(rfd);
}

#[test]
fn reclaim_while_blocked_in_read() {
    init_log();
    let rt = Runtime::new().unwrap();
    let (rfd, wfd) = pipe();

    let reader = rt
        .create("reader", move |rt| {
            let mut buf = [0u8; 10];
            loop {
                let n = coio::read(rt, rfd, &mut buf).unwrap();
                if n == 0 {
                    return;
                }
            }
        })
        .unwrap();

    rt.transfer(reader).unwrap();
    close(wfd);

    // the destructor registered by the read wrapper stops the watcher
    rt.reclaim(reader).unwrap();
    rt.run();
    assert!(rt.is_reclaimed(reader));
    close(rfd);
}

#[test]
fn read_write_all_move_a_megabyte() {
    init_log();
    let rt = Runtime::new().unwrap();
    let (rfd, wfd) = pipe();

    const SIZE: usize = 1024 * 1024;

    let reader = rt
        .create("reader_all", move |rt| {
            let mut buf = vec![0u8; SIZE];
            let n = coio::read_all(rt, rfd, &mut buf).unwrap();
            assert_eq!(n, SIZE);
        })
        .unwrap();
    let writer = rt
        .create("writer_all", move |rt| {
            let buf = vec![0u8; SIZE];
            let n = coio::write_all(rt, wfd, &buf).unwrap();
            assert_eq!(n, SIZE);
            close(wfd);
        })
        .unwrap();

    rt.transfer(reader).unwrap();
    rt.transfer(writer).unwrap();
    rt.run();

    assert!(rt.is_reclaimed(reader));
    assert!(rt.is_reclaimed(writer));
    close(rfd);
}

#[test]
fn readline_splits_on_newlines() {
    init_log();
    let rt = Runtime::new().unwrap();
    let (rfd, wfd) = pipe();

    let text = "Lorem ipsum dolor sit amet,\n\
                consectetur adipiscing elit.\n\
                Phasellus pharetra turpis eros,\n\
                eu blandit nulla.\n\
                Cras placerat egestas tortor,\n\
                vel ullamcorper turpis commodo vitae.\n\
                In.";

    let reader = rt
        .create("line_reader", move |rt| {
            let expected = [
                "Lorem ipsum dolor sit amet,\n",
                "consectetur adipiscing elit.\n",
                "Phasellus pharetra turpis eros,\n",
                "eu blandit nulla.\n",
                "Cras placerat egestas tortor,\n",
                // the buffer is shorter than the whole line
                "vel ullamcorper turpis commodo vi",
                "In.",
            ];
            let mut buf = [0u8; 34];
            for line in expected.iter() {
                let n = coio::readline(rt, rfd, &mut buf).unwrap();
                assert!(n > 0);
                assert_eq!(&buf[..n], line.as_bytes());
                assert_eq!(buf[n], 0);
            }
            // nothing left
            assert_eq!(coio::readline(rt, rfd, &mut buf).unwrap(), 0);
        })
        .unwrap();
    let writer = rt
        .create("line_writer", move |rt| {
            let n = coio::write_all(rt, wfd, text.as_bytes()).unwrap();
            assert_eq!(n, text.len());
            close(wfd);
        })
        .unwrap();

    rt.transfer(reader).unwrap();
    rt.transfer(writer).unwrap();
    rt.run();

    assert!(rt.is_reclaimed(reader));
    assert!(rt.is_reclaimed(writer));
    close(rfd);
}

#[test]
fn tcp_accept_connect_echo() {
    init_log();
    let rt = Runtime::new().unwrap();

    let listener = CoIOListener::bind(&rt, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Rc::new(Cell::new(false));

    let server = rt
        .create("server", {
            let served = served.clone();
            move |_| {
                let conn = listener.accept().unwrap();
                let mut buf = [0u8; 64];
                let n = conn.read(&mut buf).unwrap();
                conn.write(&buf[..n]).unwrap();
                served.set(true);
            }
        })
        .unwrap();
    let client = rt
        .create("client", move |rt| {
            let conn = CoIOStream::connect(rt, addr).unwrap();
            conn.write(b"ping").unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ping");
        })
        .unwrap();

    rt.transfer(server).unwrap();
    rt.transfer(client).unwrap();
    rt.run();

    assert!(rt.is_reclaimed(server));
    assert!(rt.is_reclaimed(client));
    assert!(served.get());
}
