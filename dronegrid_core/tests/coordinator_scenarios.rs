//! Coordinator behaviour against in-memory dependents.

use dronegrid_core::{
    frame_reader, frame_writer, ChannelUi, Coordinator, CoordinatorConfig, CoordinatorLinks, CoreError, Flow,
    FrameReader, FrameWriter, Message, Renderer, UiEvent, WorldState,
};
use dronegrid_env::{Point, Role, TokioContext};
use futures::{FutureExt, SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// A dependent's view of its channel pair with the coordinator.
struct Peer {
    rx: FrameReader,
    tx: FrameWriter,
}

impl Peer {
    async fn send(&mut self, message: Message) {
        self.tx.send(message).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.rx.next())
            .await
            .expect("frame within a second")
            .expect("channel open")
            .expect("well-formed frame")
            .into_message()
            .unwrap()
    }

    fn nothing_pending(&mut self) -> bool {
        self.rx.next().now_or_never().is_none()
    }
}

#[derive(Clone, Default)]
struct RecordingRenderer {
    renders: Arc<Mutex<u32>>,
    statuses: Arc<Mutex<Vec<String>>>,
}

impl Renderer for RecordingRenderer {
    fn render(&mut self, _world: &WorldState) -> Result<(), CoreError> {
        *self.renders.lock().unwrap() += 1;
        Ok(())
    }

    fn status(&mut self, line: &str) -> Result<(), CoreError> {
        self.statuses.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

struct Harness {
    coordinator: Coordinator<TokioContext>,
    physics: Peer,
    obstacles: Peer,
    targets: Peer,
    relay: Peer,
    supervisor: FrameReader,
    ui: UnboundedSender<UiEvent>,
    renderer: RecordingRenderer,
}

fn peer_pair() -> (Peer, FrameReader, FrameWriter) {
    let (peer_out, coord_in) = tokio::io::duplex(64 * 1024);
    let (coord_out, peer_in) = tokio::io::duplex(64 * 1024);
    (
        Peer {
            rx: frame_reader(peer_in),
            tx: frame_writer(peer_out),
        },
        frame_reader(coord_in),
        frame_writer(coord_out),
    )
}

fn harness() -> Harness {
    let mut links = CoordinatorLinks::new();
    let mut peers = Vec::new();
    for role in [Role::Physics, Role::ObstacleGenerator, Role::TargetGenerator, Role::Relay] {
        let (peer, from, to) = peer_pair();
        links = links.dependent(role, from, to);
        peers.push(peer);
    }
    let (sup_out, sup_in) = tokio::io::duplex(4096);
    links = links.supervisor(frame_writer(sup_out));

    let (ui_tx, ui) = ChannelUi::new();
    let renderer = RecordingRenderer::default();
    let config = CoordinatorConfig {
        window: (40, 20),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(
        TokioContext::shared(11),
        config,
        links,
        Box::new(renderer.clone()),
        Box::new(ui),
    );

    let relay = peers.pop().unwrap();
    let targets = peers.pop().unwrap();
    let obstacles = peers.pop().unwrap();
    let physics = peers.pop().unwrap();
    Harness {
        coordinator,
        physics,
        obstacles,
        targets,
        relay,
        supervisor: frame_reader(sup_in),
        ui: ui_tx,
        renderer,
    }
}

fn points(raw: &[(i32, i32)]) -> Vec<Point> {
    raw.iter().map(|(x, y)| Point::new(*x, *y)).collect()
}

#[tokio::test]
async fn test_startup_announces_window() {
    let mut h = harness();
    h.coordinator.start().await.unwrap();
    for peer in [&mut h.physics, &mut h.obstacles, &mut h.targets, &mut h.relay] {
        assert_eq!(peer.recv().await, Message::Size { width: 40, height: 20 });
    }
    assert!(*h.renderer.renders.lock().unwrap() >= 1);
}

#[tokio::test]
async fn test_size_is_adopted_and_broadcast() {
    let mut h = harness();
    h.relay.send(Message::Size { width: 80, height: 24 }).await;
    assert_eq!(h.coordinator.step().await.unwrap(), Flow::Continue);

    assert_eq!(h.coordinator.world().window, (80, 24));
    let expected = Message::Size { width: 80, height: 24 };
    assert_eq!(h.physics.recv().await, expected);
    assert_eq!(h.obstacles.recv().await, expected);
    assert_eq!(h.targets.recv().await, expected);
    // Not echoed back to where it came from.
    assert!(h.relay.nothing_pending());
}

#[tokio::test]
async fn test_obstacles_are_stored_and_forwarded_verbatim() {
    let mut h = harness();
    let set = points(&[(1, 1), (5, 5), (9, 2)]);
    let sent = Message::Obstacles(set.clone()).to_frame();
    h.obstacles.tx.send(sent.clone()).await.unwrap();
    h.coordinator.step().await.unwrap();

    assert_eq!(h.coordinator.world().obstacles, set);
    for peer in [&mut h.physics, &mut h.targets] {
        let frame = peer.rx.next().await.unwrap().unwrap();
        assert_eq!(frame, sent);
    }
    assert!(h.obstacles.nothing_pending());
    assert!(h.relay.nothing_pending());
}

#[tokio::test]
async fn test_targets_are_stored_and_forwarded() {
    let mut h = harness();
    let set = points(&[(3, 3), (7, 4)]);
    h.targets.send(Message::Targets(set.clone())).await;
    h.coordinator.step().await.unwrap();

    assert_eq!(h.coordinator.world().targets, set);
    assert_eq!(h.physics.recv().await, Message::Targets(set.clone()));
    assert_eq!(h.obstacles.recv().await, Message::Targets(set));
    assert!(h.targets.nothing_pending());
}

/// Loads obstacles and targets and drains the forwarded copies.
async fn seed_world(h: &mut Harness, obstacles: &[(i32, i32)], targets: &[(i32, i32)]) {
    h.obstacles.send(Message::Obstacles(points(obstacles))).await;
    h.coordinator.step().await.unwrap();
    h.targets.send(Message::Targets(points(targets))).await;
    h.coordinator.step().await.unwrap();

    h.physics.recv().await;
    h.physics.recv().await;
    h.targets.recv().await;
    h.obstacles.recv().await;
}

#[tokio::test]
async fn test_out_of_order_target_is_relocated() {
    let mut h = harness();
    seed_world(&mut h, &[(5, 5)], &[(3, 3), (7, 4), (12, 9)]).await;

    h.physics.send(Message::Position { x: 7.2, y: 4.9 }).await;
    h.coordinator.step().await.unwrap();

    let world = h.coordinator.world();
    assert_eq!(world.targets.len(), 3);
    assert_eq!(world.targets_reached, 0);
    assert_eq!(world.targets[0], Point::new(3, 3));
    assert_eq!(world.targets[2], Point::new(12, 9));
    let moved = world.targets[1];
    assert_ne!(moved, Point::new(7, 4));
    assert_ne!(moved, Point::new(5, 5));
    let expected = Message::Targets(world.targets.clone());

    assert_eq!(h.physics.recv().await, expected);
    assert_eq!(h.obstacles.recv().await, expected);
    assert_eq!(h.relay.recv().await, Message::Position { x: 7.2, y: 4.9 });
    assert!(h.targets.nothing_pending());
}

#[tokio::test]
async fn test_expected_target_is_consumed() {
    let mut h = harness();
    seed_world(&mut h, &[(5, 5)], &[(3, 3), (7, 4)]).await;

    h.physics.send(Message::Position { x: 3.5, y: 3.0 }).await;
    h.coordinator.step().await.unwrap();

    let world = h.coordinator.world();
    assert_eq!(world.targets, points(&[(7, 4)]));
    assert_eq!(world.targets_reached, 1);
    assert_eq!(h.physics.recv().await, Message::Targets(points(&[(7, 4)])));
    assert_eq!(h.obstacles.recv().await, Message::Targets(points(&[(7, 4)])));
    assert!(h.targets.nothing_pending());
}

#[tokio::test]
async fn test_last_target_requests_new_set() {
    let mut h = harness();
    seed_world(&mut h, &[(5, 5), (6, 1)], &[(2, 2)]).await;

    h.physics.send(Message::Position { x: 2.0, y: 2.0 }).await;
    h.coordinator.step().await.unwrap();

    assert!(h.coordinator.world().targets.is_empty());
    assert_eq!(h.physics.recv().await, Message::Targets(Vec::new()));
    assert_eq!(h.targets.recv().await, Message::Obstacles(points(&[(5, 5), (6, 1)])));
}

#[tokio::test]
async fn test_interleaved_updates_keep_last_value_per_field() {
    let mut h = harness();
    let first = points(&[(1, 1), (2, 2)]);
    let second = points(&[(8, 8), (9, 9), (10, 10)]);
    let targets = points(&[(15, 15)]);

    h.obstacles.send(Message::Obstacles(first.clone())).await;
    h.physics.send(Message::Position { x: 4.0, y: 4.0 }).await;
    h.targets.send(Message::Targets(targets.clone())).await;
    h.obstacles.send(Message::Obstacles(second.clone())).await;
    h.physics.send(Message::Position { x: 6.5, y: 3.25 }).await;

    for _ in 0..10 {
        h.coordinator.step().await.unwrap();
    }

    let world = h.coordinator.world();
    assert_eq!(world.obstacles, second);
    assert_eq!(world.targets, targets);
    assert_eq!(world.drone, (6.5, 3.25));

    // Every copy physics saw is one complete set, in send order.
    let mut obstacle_sets = Vec::new();
    while let Some(Some(Ok(frame))) = h.physics.rx.next().now_or_never() {
        if let Message::Obstacles(set) = frame.into_message().unwrap() {
            obstacle_sets.push(set);
        }
    }
    assert_eq!(obstacle_sets, vec![first, second]);
}

#[tokio::test]
async fn test_force_status_redrawn_only_on_change() {
    let mut h = harness();
    let force = Message::Force(dronegrid_core::ForceReport::parse("1 0 0 0 0 0 0 0").unwrap());
    h.physics.send(force.clone()).await;
    h.coordinator.step().await.unwrap();
    h.physics.send(force).await;
    h.coordinator.step().await.unwrap();

    let statuses = h.renderer.statuses.lock().unwrap().clone();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].contains("drn(1.0000 0.0000)"));
}

#[tokio::test]
async fn test_keys_are_forwarded_to_physics() {
    let mut h = harness();
    h.ui.send(UiEvent::Key('e')).unwrap();
    h.ui.send(UiEvent::Key('d')).unwrap();
    h.coordinator.step().await.unwrap();

    assert_eq!(h.physics.recv().await, Message::Input('e'));
    assert_eq!(h.physics.recv().await, Message::Input('d'));
    assert!(h.obstacles.nothing_pending());
}

#[tokio::test]
async fn test_resize_rebroadcasts_size() {
    let mut h = harness();
    h.ui.send(UiEvent::Resize { width: 100, height: 30 }).unwrap();
    h.coordinator.step().await.unwrap();

    assert_eq!(h.coordinator.world().window, (100, 30));
    for peer in [&mut h.physics, &mut h.obstacles, &mut h.targets, &mut h.relay] {
        assert_eq!(peer.recv().await, Message::Size { width: 100, height: 30 });
    }
}

#[tokio::test]
async fn test_quit_key_broadcasts_exit() {
    let mut h = harness();
    h.ui.send(UiEvent::Key('q')).unwrap();
    assert_eq!(h.coordinator.step().await.unwrap(), Flow::Quit);

    for peer in [&mut h.physics, &mut h.obstacles, &mut h.targets, &mut h.relay] {
        assert_eq!(peer.recv().await, Message::Exit);
    }
    let frame = h.supervisor.next().await.unwrap().unwrap();
    assert_eq!(frame.into_message().unwrap(), Message::Exit);
}

#[tokio::test]
async fn test_peer_exit_stops_the_loop() {
    let mut h = harness();
    h.relay.send(Message::Exit).await;
    let summary = tokio::time::timeout(Duration::from_secs(2), h.coordinator.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.frames_applied, 1);
    // Startup SIZE, then EXIT.
    assert!(matches!(h.physics.recv().await, Message::Size { .. }));
    assert_eq!(h.physics.recv().await, Message::Exit);
}

#[tokio::test]
async fn test_remote_drone_becomes_physics_obstacle() {
    let mut h = harness();
    h.relay.send(Message::Position { x: 12.7, y: 3.1 }).await;
    h.coordinator.step().await.unwrap();

    assert_eq!(h.coordinator.world().remote_drone, Some((12.7, 3.1)));
    assert_eq!(h.physics.recv().await, Message::Obstacles(points(&[(12, 3)])));
    assert!(h.targets.nothing_pending());
}

#[tokio::test]
async fn test_malformed_frame_does_not_desync_channel() {
    let mut h = harness();
    let bad = dronegrid_core::Frame::new(dronegrid_core::FrameKind::Position, "not numbers", Vec::new());
    h.physics.tx.send(bad).await.unwrap();
    h.physics.send(Message::Position { x: 9.0, y: 9.0 }).await;
    h.coordinator.step().await.unwrap();
    h.coordinator.step().await.unwrap();

    assert_eq!(h.coordinator.world().drone, (9.0, 9.0));
    assert_eq!(h.coordinator.open_inbound(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_relocation_goes_to_physics_only() {
    let mut h = harness();
    let set = points(&[(4, 4), (8, 8), (12, 12)]);
    h.obstacles.send(Message::Obstacles(set.clone())).await;
    h.coordinator.step().await.unwrap();
    assert_eq!(h.physics.recv().await, Message::Obstacles(set.clone()));
    assert_eq!(h.targets.recv().await, Message::Obstacles(set.clone()));

    tokio::time::advance(Duration::from_secs(5)).await;
    h.coordinator.step().await.unwrap();

    let relocated = match h.physics.recv().await {
        Message::Obstacles(points) => points,
        other => panic!("expected obstacles, got {:?}", other),
    };
    assert_eq!(relocated.len(), 3);
    let unchanged = relocated.iter().zip(&set).filter(|(a, b)| a == b).count();
    assert!(unchanged >= 2);
    assert_eq!(h.coordinator.world().obstacles, relocated);
    assert!(h.targets.nothing_pending());
}
