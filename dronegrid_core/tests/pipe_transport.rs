//! Frames crossing a real OS pipe that delivers them a few bytes at a time.

use bytes::BytesMut;
use dronegrid_core::{frame_reader, ForceReport, FrameCodec, FrameReader, Message};
use dronegrid_env::{Pipe, Point};
use futures::StreamExt;
use std::fs::File;
use std::io::Write;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio_util::codec::Encoder;

/// Writes `messages` into a pipe in `chunk`-byte pieces from a plain thread.
fn trickle(messages: Vec<Message>, chunk: usize) -> (FrameReader, JoinHandle<()>) {
    let Pipe { read, write } = Pipe::new().unwrap();
    let receiver = pipe::Receiver::from_file(File::from(read)).unwrap();

    let mut wire = BytesMut::new();
    for message in messages {
        FrameCodec.encode(message, &mut wire).unwrap();
    }
    let writer = std::thread::spawn(move || {
        let mut file = File::from(write);
        for piece in wire.chunks(chunk) {
            file.write_all(piece).unwrap();
            file.flush().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    (frame_reader(receiver), writer)
}

async fn next_message(reader: &mut FrameReader) -> Message {
    tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("frame within deadline")
        .expect("stream open")
        .expect("well-formed frame")
        .into_message()
        .unwrap()
}

#[tokio::test]
async fn test_bulk_body_split_across_short_reads() {
    let obstacles: Vec<Point> = (0..40).map(|i| Point::new(i, 2 * i + 1)).collect();
    let targets = vec![Point::new(7, 3), Point::new(60, 20)];
    let (mut reader, writer) = trickle(
        vec![
            Message::Obstacles(obstacles.clone()),
            Message::Targets(targets.clone()),
            Message::Exit,
        ],
        7,
    );

    assert_eq!(next_message(&mut reader).await, Message::Obstacles(obstacles));
    assert_eq!(next_message(&mut reader).await, Message::Targets(targets));
    assert_eq!(next_message(&mut reader).await, Message::Exit);

    writer.join().unwrap();
    assert!(reader.next().await.is_none());
}

#[tokio::test]
async fn test_wide_force_report_crosses_pipe_intact() {
    let report = ForceReport {
        drone: [-10.0, -10.0],
        obstacle: [-1250.75, 980.5],
        wall: [-4321.5, 2750.125],
        target: [-12.25, -12.25],
    };
    let (mut reader, writer) = trickle(
        vec![
            Message::Force(report),
            Message::Position { x: 39.5, y: -0.25 },
        ],
        3,
    );

    assert_eq!(next_message(&mut reader).await, Message::Force(report));
    assert_eq!(next_message(&mut reader).await, Message::Position { x: 39.5, y: -0.25 });
    writer.join().unwrap();
}
