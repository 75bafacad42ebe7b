use std::path::PathBuf;
use std::sync::Arc;

use common::{ExecutionClient, InstrumentGroup, ReportRecord, Settings};
use engine::{report_path, JsonLinesReport, LineFeed, SessionEnd, Worker};
use paper::PaperClient;
use tokio::fs::File;
use tokio::io::BufReader;

fn workspace_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

#[tokio::test]
async fn sample_session_replays_cleanly() {
    let settings =
        Settings::from_toml_str(include_str!("../../../config/quorum.toml")).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let group = InstrumentGroup::new(1, vec!["AAPL".into(), "NVDA".into()]);

    let (client, events) = PaperClient::new(settings.execution.clone());
    let client: Arc<dyn ExecutionClient> = Arc::new(client);
    let path = report_path(dir.path(), &settings.name, group.id);
    let report = JsonLinesReport::open(&path).unwrap();
    let worker = Worker::new(&settings, group, client, events, Box::new(report)).unwrap();

    let file = File::open(workspace_file("data/bars.jsonl")).await.unwrap();
    let outcome = worker
        .run(LineFeed::new(BufReader::new(file)), std::future::pending())
        .await
        .unwrap();

    assert_eq!(outcome.end, SessionEnd::ServerExit);
    // 60 bars each for the two owned instruments; the other two are foreign
    assert_eq!(outcome.summary.bars_processed, 120);
    assert_eq!(outcome.summary.bars_discarded, 120);
    assert_eq!(outcome.summary.positions_handed_off, 0);

    let records: Vec<ReportRecord> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(matches!(records.last(), Some(ReportRecord::Summary(_))));

    let closed: Vec<_> = records
        .iter()
        .filter_map(|r| match r {
            ReportRecord::Position(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(closed.len(), outcome.summary.positions_closed);
    for position in closed {
        assert!(position.instrument == "AAPL" || position.instrument == "NVDA");
        assert!(position.closed_at >= position.opened_at);
        assert_eq!(position.group, 1);
    }
}
