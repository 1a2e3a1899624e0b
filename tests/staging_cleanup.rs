mod common;

use common::TestServer;
use std::time::Duration;

#[tokio::test]
async fn test_startup_purges_stale_staging_files() {
    let mut leftover = None;
    let server = TestServer::start_with(common::fixture_items(), |config| {
        config.staging.stale_after_secs = 0;
        std::fs::create_dir_all(&config.staging.dir).unwrap();
        let path = config.staging.dir.join("report_r1_dead_main.js");
        std::fs::write(&path, "page.text('left behind');").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        leftover = Some(path);
    })
    .await
    .expect("server starts");

    assert!(!leftover.unwrap().exists());
    assert!(server.staged_files().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_fresh_files_survive_startup_purge() {
    let mut fresh = None;
    let server = TestServer::start_with(common::fixture_items(), |config| {
        std::fs::create_dir_all(&config.staging.dir).unwrap();
        let path = config.staging.dir.join("report_r1_live_main.js");
        std::fs::write(&path, "1;").unwrap();
        fresh = Some(path);
    })
    .await
    .expect("server starts");

    assert!(fresh.unwrap().exists());
    assert_eq!(server.staged_files().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_renders_leave_nothing_behind() {
    let server = TestServer::start().await.expect("server starts");
    let scripts = [
        "paths.writeTemp('a.csv', 'x'); throw new Error('boom');",
        "paths.writeTemp('b.csv', 'y'); let s = 'x'; for (;;) { s += s; }",
        "paths.writeTemp('c.csv', 'z'); syntax error here",
        "storage.getText('/elsewhere/missing.txt');",
    ];

    for script in scripts {
        server.objects.put("r1/main.js", script);
        let body = server.get("/?id=r1").await.text().await.unwrap();
        assert!(body.contains("report-error"), "expected an error for {script}");
        assert!(
            server.staged_files().is_empty(),
            "staged files left after {script}: {:?}",
            server.staged_files()
        );
    }

    server.shutdown().await;
}
