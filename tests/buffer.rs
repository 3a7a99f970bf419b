use std::rc::Rc;

use fibrio::buffer::Buffer;
use fibrio::fiber::Runtime;
use fibrio::Error;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const MAGIC: u64 = 0xdeadbeef;

#[test]
fn basic_transactions_in_one_fiber() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt
        .create("basic_buffer", |rt| {
            const COUNT: u64 = 1000;
            let word = std::mem::size_of::<u64>();
            let buffer = Buffer::new(rt, COUNT as usize * word).unwrap();

            // an aborted prepare leaves no trace
            let span = buffer.alloc_prepare(10 * word).unwrap();
            span[0] = 0xff;
            buffer.alloc_abort();
            assert_eq!(buffer.bytes(), 0);

            for i in 0..COUNT {
                let span = buffer.alloc_prepare(word).unwrap();
                span.copy_from_slice(&i.to_ne_bytes());
                buffer.alloc_commit();
            }
            assert_eq!(buffer.bytes(), COUNT as usize * word);

            // growing keeps the content, shrinking requests are no-ops
            buffer.resize(0).unwrap();
            buffer.resize(COUNT as usize * word).unwrap();
            buffer.resize(COUNT as usize * word * 2).unwrap();

            // a discarded read does not consume
            let span = buffer.read_address(word).unwrap();
            assert_eq!(span, &0u64.to_ne_bytes()[..]);
            buffer.read_discard();

            for i in 0..COUNT {
                let span = buffer.read_address(word).unwrap();
                assert_eq!(span, &i.to_ne_bytes()[..], "message {}", i);
                buffer.read_advance();
            }
            assert_eq!(buffer.bytes(), 0);
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    rt.run();
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn oversize_and_zero_transactions_are_invalid() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt
        .create("invalid_buffer", |rt| {
            let buffer = Buffer::new(rt, 16).unwrap();
            let cap = buffer.capacity();
            assert!(matches!(
                buffer.alloc_prepare(cap + 1),
                Err(Error::Invalid(_))
            ));
            assert!(matches!(buffer.alloc_prepare(0), Err(Error::Invalid(_))));
            assert!(matches!(
                buffer.read_address(cap + 1),
                Err(Error::Invalid(_))
            ));
            assert!(matches!(buffer.read_address(0), Err(Error::Invalid(_))));
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn two_writers_one_reader() {
    init_log();
    let rt = Runtime::new().unwrap();

    let buffer = Rc::new(Buffer::new(&rt, 0).unwrap());
    // three messages fill the buffer, forcing both sides to suspend
    let write_size = buffer.free_bytes() / 3;
    const COUNT: usize = 1000;

    let reader = rt
        .create("reader_buffer", {
            let buffer = buffer.clone();
            move |_| {
                for _ in 0..2 * COUNT {
                    let span = buffer.read_address(write_size).unwrap();
                    assert_eq!(&span[..8], &MAGIC.to_ne_bytes()[..]);
                    buffer.read_advance();
                }
            }
        })
        .unwrap();

    let mut writers = Vec::new();
    for name in &["writer_buffer_1", "writer_buffer_2"] {
        let writer = rt
            .create(name, {
                let buffer = buffer.clone();
                move |_| {
                    for _ in 0..COUNT {
                        let span = buffer.alloc_prepare(write_size).unwrap();
                        span[..8].copy_from_slice(&MAGIC.to_ne_bytes());
                        buffer.alloc_commit();
                    }
                }
            })
            .unwrap();
        writers.push(writer);
    }

    rt.transfer(reader).unwrap();
    for writer in &writers {
        rt.transfer(*writer).unwrap();
    }

    rt.run();

    assert!(rt.is_reclaimed(reader));
    for writer in &writers {
        assert!(rt.is_reclaimed(*writer));
    }
}
