use criterion::{criterion_group, criterion_main, Criterion};
use quill_collab::{
    ColorAssigner, ConnectRequest, Connector, Document, EventSink, FieldMap, HubTransport,
    LocalHub, LocalIdentity, Participant, SessionConfig, SessionManager, Transport,
    CURSOR_FIELD, USER_FIELD,
};
use serde_json::json;
use std::hint::black_box;
use tokio::runtime::{Builder, Runtime};

fn peer_fields(id: u64) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(
        USER_FIELD.into(),
        json!({ "id": id, "name": format!("peer-{id}"), "color": "#958DF1" }),
    );
    fields.insert(CURSOR_FIELD.into(), json!({ "x": id as f64, "y": 2.0 * id as f64 }));
    fields
}

fn bench_participant_parse(c: &mut Criterion) {
    let fields = peer_fields(7);

    c.bench_function("participant_parse", |b| {
        b.iter(|| {
            black_box(Participant::from_fields(7, black_box(fields.clone())));
        })
    });
}

/// `count` raw hub members in `room`, each with a user and a cursor.
/// Their event receivers are dropped, so nothing queues up.
fn populate(hub: &LocalHub, room: &str, count: u64, config: &SessionConfig) -> Vec<HubTransport> {
    (0..count)
        .map(|_| {
            let (sink, _rx) = EventSink::channel();
            let document = Document::new();
            let request = ConnectRequest { room, document: &document, config };
            let mut member = hub.connect(request, sink).unwrap();
            let id = member.client_id();
            for (key, value) in peer_fields(id) {
                member.set_local_state_field(&key, value);
            }
            member
        })
        .collect()
}

fn bench_config() -> SessionConfig {
    SessionConfig {
        max_conns: 128,
        ..SessionConfig::default()
    }
}

/// One session sharing a room with 100 publishing members.
fn session_with_100_peers(
    rt: &Runtime,
    hub: &LocalHub,
) -> (SessionManager<LocalHub>, Vec<HubTransport>) {
    let config = bench_config();
    let members = populate(hub, "bench", 100, &config);
    let session = SessionManager::new(hub.clone(), Document::new(), config);
    {
        let _guard = rt.enter();
        session.enter("bench", LocalIdentity::new("bench")).unwrap();
    }
    rt.block_on(async {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    });
    (session, members)
}

fn bench_hub_states_100_members(c: &mut Criterion) {
    let hub = LocalHub::new();
    let members = populate(&hub, "bench", 100, &bench_config());

    c.bench_function("hub_states_100_members", |b| {
        b.iter(|| {
            black_box(members[0].states());
        })
    });
}

fn bench_session_mirror_100_peers(c: &mut Criterion) {
    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let hub = LocalHub::new();
    let (session, mut members) = session_with_100_peers(&rt, &hub);
    let mut x = 0.0;

    c.bench_function("session_mirror_100_peers", |b| {
        b.iter(|| {
            x += 1.0;
            members[0].set_local_state_field(CURSOR_FIELD, json!({ "x": x, "y": 0.0 }));
            rt.block_on(tokio::task::yield_now());
            black_box(session.presence().snapshot().len());
        })
    });
}

fn bench_cursor_view_100_peers(c: &mut Criterion) {
    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let hub = LocalHub::new();
    let (session, _members) = session_with_100_peers(&rt, &hub);
    let snapshot = session.presence().snapshot();
    assert_eq!(snapshot.cursors().len(), 100);

    c.bench_function("cursor_view_100_peers", |b| {
        b.iter(|| {
            black_box(black_box(&snapshot).cursors());
        })
    });
}

fn bench_color_for_client(c: &mut Criterion) {
    let colors = ColorAssigner::default();

    c.bench_function("color_for_client", |b| {
        b.iter(|| {
            black_box(colors.for_client(black_box(42)));
        })
    });
}

fn bench_hub_cursor_fanout_50(c: &mut Criterion) {
    let hub = LocalHub::new();
    let config = SessionConfig {
        max_conns: 64,
        ..SessionConfig::default()
    };
    let document = Document::new();
    let mut receivers = Vec::new();
    let mut members = Vec::new();
    for _ in 0..50 {
        let (sink, rx) = EventSink::channel();
        let request = ConnectRequest { room: "bench", document: &document, config: &config };
        members.push(hub.connect(request, sink).unwrap());
        receivers.push(rx);
    }
    let mut x = 0.0;

    c.bench_function("hub_cursor_fanout_50", |b| {
        b.iter(|| {
            x += 1.0;
            members[0].set_local_state_field(CURSOR_FIELD, json!({ "x": x, "y": 0.0 }));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_participant_parse,
    bench_hub_states_100_members,
    bench_session_mirror_100_peers,
    bench_cursor_view_100_peers,
    bench_color_for_client,
    bench_hub_cursor_fanout_50,
);
criterion_main!(benches);
