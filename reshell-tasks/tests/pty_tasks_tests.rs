use reshell_shell::{CommandBuilder, PendingTask, Pty, PtySize, PtyTaskRunner};
use reshell_tasks::{NoOpCallback, PtyExecutor, TaskConfig, TaskRunner};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn bash() -> CommandBuilder {
    let mut cmd = CommandBuilder::new("bash");
    cmd.args([
        "--noprofile",
        "--norc",
        "-i",
        "-c",
        "set +o history; PS1='$ '; echo __RESHELL_SHELL_READY__; exec bash --noprofile --norc -i",
    ]);
    cmd.env("PS1", "$ ");
    cmd.env("TERM", "dumb");
    cmd
}

fn task(name: &str, command: &str) -> TaskConfig {
    TaskConfig {
        name: name.into(),
        command: command.into(),
        cwd: None,
        env: BTreeMap::new(),
        in_shell: true,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_shell_tasks_share_the_live_shell() {
    let (task_tx, mut task_rx) = mpsc::channel::<PendingTask>(1);

    let shell = tokio::spawn(async move {
        let size = PtySize {
            rows: 24,
            cols: 200,
            pixel_width: 0,
            pixel_height: 0,
        };
        let (mut pty, mut output) = Pty::spawn(bash(), size).expect("spawn bash");
        let mut runner = PtyTaskRunner::new(&mut pty, &mut output, Duration::from_secs(20));
        runner.run(&mut task_rx).await.expect("task phase")
    });

    let mut first = task("greet", "echo \"$GREETING\"");
    first.env.insert("GREETING".into(), "hi".into());
    let tasks = vec![
        first,
        task("remember", "echo \"still $GREETING\""),
        task(
            "no-output-file",
            "echo \"file=${RESHELL_TASK_OUTPUT_FILE-unset}\"",
        ),
    ];

    let outcomes = tokio::time::timeout(
        Duration::from_secs(30),
        TaskRunner::new(tasks, CancellationToken::new())
            .with_pty(PtyExecutor::new(task_tx))
            .run(&NoOpCallback),
    )
    .await
    .expect("timed out")
    .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.result.success), "{:?}", outcomes);
    assert_eq!(outcomes[0].result.stdout_lines, ["hi"]);
    assert_eq!(outcomes[1].result.stdout_lines, ["still hi"]);
    // The capture file belongs to subprocess tasks; the live shell keeps
    // no reference to it.
    assert_eq!(outcomes[2].result.stdout_lines, ["file=unset"]);
    assert_eq!(outcomes[2].outputs, serde_json::Value::Null);

    // The runner dropped its sender, so the task phase ends.
    let replay = tokio::time::timeout(Duration::from_secs(10), shell)
        .await
        .expect("task phase did not finish")
        .unwrap();
    let replayed = String::from_utf8_lossy(&replay.into_bytes()).into_owned();
    assert!(!replayed.contains("__RESHELL_TASK_END"));
}
