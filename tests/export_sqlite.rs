use pretty_assertions::assert_eq;
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use synapse_room_logger::run::{FailedStage, RunState};
use synapse_room_logger::{
    CheckpointStore, Exporter, FileAppender, FileLayout, RecordMapper, SqliteEventStore,
    StoredWatermark,
};
use tempfile::{TempDir, tempdir};

// 2023-05-01T00:00:00Z
const MAY_1: i64 = 1_682_899_200_000;
const DAY_MS: i64 = 86_400_000;

struct Homeserver {
    _dir: TempDir,
    db: PathBuf,
    out: PathBuf,
}

impl Homeserver {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let db = dir.path().join("homeserver.db");
        let out = dir.path().join("logs");
        fs::create_dir(&out).unwrap();
        Connection::open(&db)
            .unwrap()
            .execute_batch(
                "CREATE TABLE events (
                    stream_ordering INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL UNIQUE,
                    room_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    received_ts BIGINT
                 );
                 CREATE TABLE event_json (
                    event_id TEXT NOT NULL UNIQUE,
                    room_id TEXT NOT NULL,
                    internal_metadata TEXT NOT NULL DEFAULT '{}',
                    json TEXT NOT NULL,
                    format_version INTEGER
                 );",
            )
            .unwrap();
        Self { _dir: dir, db, out }
    }

    fn insert(&self, event_type: &str, room_id: &str, received_ts: i64, envelope: Value) {
        let event_id = envelope["event_id"].as_str().unwrap().to_string();
        let conn = Connection::open(&self.db).unwrap();
        conn.execute(
            "INSERT INTO events (event_id, room_id, type, received_ts) VALUES (?1, ?2, ?3, ?4)",
            params![event_id, room_id, event_type, received_ts],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO event_json (event_id, room_id, json) VALUES (?1, ?2, ?3)",
            params![event_id, room_id, envelope.to_string()],
        )
        .unwrap();
    }

    fn say(&self, room_id: &str, received_ts: i64, body: &str) {
        self.insert(
            "m.room.message",
            room_id,
            received_ts,
            json!({
                "type": "m.room.message",
                "origin_server_ts": received_ts - 5,
                "origin": "example.org",
                "sender": "@alice:example.org",
                "event_id": format!("${received_ts}:example.org"),
                "room_id": room_id,
                "content": {"msgtype": "m.text", "body": body},
            }),
        );
    }

    fn exporter(&self, layout: FileLayout) -> Exporter<SqliteEventStore, FileAppender> {
        let rooms = match layout {
            FileLayout::PerRoom => BTreeMap::from([
                ("!abc:example.org".to_string(), "general".to_string()),
                ("!xyz:example.org".to_string(), "random".to_string()),
            ]),
            FileLayout::DateOnly => {
                BTreeMap::from([("!abc:example.org".to_string(), "general".to_string())])
            }
        };
        Exporter::new(
            SqliteEventStore::new(&self.db),
            CheckpointStore::in_directory(&self.out),
            RecordMapper::new(rooms, &self.out, layout),
            FileAppender::new(),
        )
    }

    fn log(&self, name: &str) -> Vec<Value> {
        read_log(&self.out.join(name))
    }
}

fn read_log(path: &Path) -> Vec<Value> {
    match fs::read_to_string(path) {
        Ok(s) => s.lines().map(|l| serde_json::from_str(l).unwrap()).collect(),
        Err(_) => Vec::new(),
    }
}

fn timestamps(lines: &[Value]) -> Vec<i64> {
    lines.iter().map(|l| l["ts"].as_i64().unwrap()).collect()
}

#[test]
fn routes_messages_by_room_and_day() {
    let hs = Homeserver::new();
    hs.say("!abc:example.org", MAY_1 + 10, "morning");
    hs.say("!xyz:example.org", MAY_1 + 20, "elsewhere");
    hs.say("!abc:example.org", MAY_1 + DAY_MS + 30, "next day");
    hs.say("!unlisted:example.org", MAY_1 + 40, "not exported");
    hs.insert(
        "m.room.member",
        "!abc:example.org",
        MAY_1 + 50,
        json!({"event_id": "$join", "room_id": "!abc:example.org"}),
    );

    let report = hs.exporter(FileLayout::PerRoom).run_once().unwrap();
    assert!(report.succeeded());
    assert_eq!(report.exported, 3);

    assert_eq!(timestamps(&hs.log("general_20230501.log")), vec![MAY_1 + 10]);
    assert_eq!(timestamps(&hs.log("random_20230501.log")), vec![MAY_1 + 20]);
    assert_eq!(
        timestamps(&hs.log("general_20230502.log")),
        vec![MAY_1 + DAY_MS + 30]
    );

    let line = &hs.log("general_20230501.log")[0];
    assert_eq!(line["message"], "morning");
    assert_eq!(line["origin_ts"], MAY_1 + 5);
    assert_eq!(line["sender"], "@alice:example.org");
    assert_eq!(line["url"], Value::Null);

    assert_eq!(
        fs::read_to_string(hs.out.join(".last_ts")).unwrap(),
        (MAY_1 + DAY_MS + 30).to_string()
    );
}

#[test]
fn later_runs_only_append_new_messages() {
    let hs = Homeserver::new();
    let mut exporter = hs.exporter(FileLayout::PerRoom);
    hs.say("!abc:example.org", MAY_1 + 1, "one");
    hs.say("!abc:example.org", MAY_1 + 2, "two");
    exporter.run_once().unwrap();

    // Nothing new: nothing written, checkpoint unchanged.
    let idle = exporter.run_once().unwrap();
    assert_eq!(idle.exported, 0);
    assert_eq!(
        exporter.checkpoint().load().unwrap(),
        StoredWatermark::At(MAY_1 + 2)
    );

    hs.say("!abc:example.org", MAY_1 + 3, "three");
    let next = exporter.run_once().unwrap();
    assert_eq!(next.started_from, MAY_1 + 2);
    assert_eq!(next.exported, 1);

    let ts = timestamps(&hs.log("general_20230501.log"));
    assert_eq!(ts, vec![MAY_1 + 1, MAY_1 + 2, MAY_1 + 3]);
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn single_room_layout_uses_date_only_names() {
    let hs = Homeserver::new();
    hs.say("!abc:example.org", MAY_1 + 1, "hello");
    hs.insert(
        "m.room.message",
        "!abc:example.org",
        MAY_1 + 2,
        json!({
            "origin_server_ts": MAY_1,
            "origin": "example.org",
            "sender": "@bob:example.org",
            "event_id": "$img:example.org",
            "room_id": "!abc:example.org",
            "content": {"msgtype": "m.image", "body": "cat.png", "url": "mxc://example.org/cat"},
        }),
    );

    hs.exporter(FileLayout::DateOnly).run_once().unwrap();

    let lines = hs.log("2023-05-01.log");
    assert_eq!(timestamps(&lines), vec![MAY_1 + 1, MAY_1 + 2]);
    assert_eq!(lines[1]["url"], "mxc://example.org/cat");
    assert!(!hs.out.join("general_20230501.log").exists());
}

#[test]
fn malformed_event_blocks_until_fixed() {
    let hs = Homeserver::new();
    hs.say("!abc:example.org", MAY_1 + 1, "fine");
    hs.insert(
        "m.room.message",
        "!abc:example.org",
        MAY_1 + 2,
        json!({
            "origin_server_ts": MAY_1,
            "origin": "example.org",
            "sender": "@bob:example.org",
            "event_id": "$redacted:example.org",
            "room_id": "!abc:example.org",
            "content": {},
        }),
    );
    hs.say("!abc:example.org", MAY_1 + 3, "after");

    let mut exporter = hs.exporter(FileLayout::PerRoom);
    for _ in 0..2 {
        let report = exporter.run_once().unwrap();
        assert_eq!(report.state(), RunState::Failed(FailedStage::Malformed));
        assert_eq!(
            exporter.checkpoint().load().unwrap(),
            StoredWatermark::Missing
        );
    }
    // The good row before the bad one is re-written on every attempt.
    assert_eq!(
        timestamps(&hs.log("general_20230501.log")),
        vec![MAY_1 + 1, MAY_1 + 1]
    );
}

#[test]
fn unreachable_database_fails_the_run_only() {
    let hs = Homeserver::new();
    let out = hs.out.clone();
    let mut exporter = Exporter::new(
        SqliteEventStore::new(out.join("no-such.db")),
        CheckpointStore::in_directory(&out),
        RecordMapper::new(
            BTreeMap::from([("!abc:example.org".to_string(), "general".to_string())]),
            &out,
            FileLayout::PerRoom,
        ),
        FileAppender::new(),
    );
    let report = exporter.run_once().unwrap();
    assert_eq!(report.state(), RunState::Failed(FailedStage::Connection));
    assert!(!out.join(".last_ts").exists());
}

#[test]
fn corrupt_checkpoint_is_fatal() {
    let hs = Homeserver::new();
    fs::write(hs.out.join(".last_ts"), "yesterday").unwrap();
    assert!(hs.exporter(FileLayout::PerRoom).run_once().is_err());
}
