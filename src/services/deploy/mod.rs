//! 部署监督
//!
//! 在后台任务中运行 ansible-playbook，逐行发布输出，并维护状态记录。
//! 调用方先取得部署名额，名额随监督任务结束而释放。

pub mod context;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::deploy::{DeployStatus, DeploymentRequest, DeploymentStatus};
use crate::infra::command::{CommandError, CommandRunner};
use crate::state::{AdmissionPermit, AppState};

pub use context::DeployContext;

/// 跳过 SSH 主机密钥校验（一次性集群）
const ANSIBLE_ENV: &[(&str, &str)] = &[("ANSIBLE_HOST_KEY_CHECKING", "False")];

/// 启动部署
///
/// 写入 started 状态后立即返回，playbook 在后台任务中执行
pub async fn start(
    state: Arc<AppState>,
    permit: AdmissionPermit,
    request: DeploymentRequest,
) -> DeploymentStatus {
    let record = DeploymentStatus::started(&request);
    state.status_store.put(record.clone()).await;

    info!(
        session_id = %request.session_id,
        playbook = %request.playbook,
        "Deployment started"
    );

    let ctx = DeployContext::new(state, record.clone());
    tokio::spawn(async move {
        run(ctx, request).await;
        // 所有终态事件发布完成后才释放名额
        drop(permit);
    });

    record
}

/// ansible-playbook 参数
pub fn playbook_args(state: &AppState, request: &DeploymentRequest) -> Vec<String> {
    let inventory = state.generator.inventory_file(&request.session_id);
    vec![
        "-i".to_string(),
        inventory.display().to_string(),
        request.playbook.clone(),
        "-b".to_string(),
        "--private-key".to_string(),
        state.config.ssh_private_key_path.display().to_string(),
        "-v".to_string(),
    ]
}

/// 执行一次部署直到终态
async fn run(mut ctx: DeployContext, request: DeploymentRequest) {
    let args = playbook_args(&ctx.state, &request);
    let command = ctx.state.config.playbook_command.clone();

    let mut child = match CommandRunner::spawn_streaming(
        &command,
        &args,
        &ctx.state.config.kubespray_dir,
        ANSIBLE_ENV,
    ) {
        Ok(child) => child,
        Err(e) => {
            error!(session_id = %request.session_id, error = %e, "Failed to spawn playbook");
            ctx.fail(&e.to_string()).await;
            return;
        }
    };

    info!(
        session_id = %request.session_id,
        pid = ?child.id(),
        program = %command.program,
        "Playbook process spawned"
    );
    ctx.update_status(DeployStatus::Running, None).await;

    // 读取出错后行流随即结束，仍等待子进程退出再进入终态
    let mut read_error: Option<CommandError> = None;
    let mut lines = 0usize;
    while let Some(line) = child.next_line().await {
        match line {
            Ok(line) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    ctx.log(line);
                    lines += 1;
                }
            }
            Err(e) => {
                warn!(session_id = %request.session_id, error = %e, "Failed to read playbook output");
                read_error.get_or_insert(e);
            }
        }
    }

    let exit = child.wait().await;

    match (read_error, exit) {
        (None, Ok(status)) => {
            // 被信号终止时没有退出码
            let code = status.code().unwrap_or(-1);
            info!(
                session_id = %request.session_id,
                exit_code = code,
                lines,
                "Playbook finished"
            );
            ctx.finish(code).await;
        }
        (Some(e), _) | (None, Err(e)) => {
            error!(session_id = %request.session_id, error = %e, "Deployment supervision failed");
            ctx.fail(&e.to_string()).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::env::EnvConfig;
    use crate::domain::deploy::DeployEvent;
    use crate::infra::command::PlaybookCommand;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state_with(tmp: &TempDir, command: PlaybookCommand) -> Arc<AppState> {
        let mut config = EnvConfig::with_kubespray_dir(tmp.path());
        config.playbook_command = command;
        Arc::new(AppState::new(config))
    }

    fn sh(script: &str) -> PlaybookCommand {
        PlaybookCommand::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    async fn collect(sub: &mut crate::state::Subscription) -> Vec<DeployEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), sub.recv())
                .await
                .expect("timed out waiting for events")
                .expect("bus closed");
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    async fn wait_released(state: &AppState) {
        for _ in 0..100 {
            if !state.admission.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot was not released");
    }

    #[test]
    fn test_playbook_args() {
        let tmp = TempDir::new().unwrap();
        let state = state_with(&tmp, PlaybookCommand::default());
        let args = playbook_args(&state, &DeploymentRequest::new("s-1", "reset.yml"));

        let inventory = tmp.path().join("inventory/s-1/inventory.ini");
        assert_eq!(
            args,
            vec![
                "-i".to_string(),
                inventory.display().to_string(),
                "reset.yml".to_string(),
                "-b".to_string(),
                "--private-key".to_string(),
                "/root/.ssh/id_rsa".to_string(),
                "-v".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_successful_run_event_order() {
        let tmp = TempDir::new().unwrap();
        // $2 是 playbook 名
        let state = state_with(
            &tmp,
            sh("echo \"PLAY [$2]\"; echo; echo \"ok: [$ANSIBLE_HOST_KEY_CHECKING]\"; exit 0"),
        );
        let mut sub = state.event_bus.subscribe("s-1");

        let permit = state.admission.try_acquire("s-1").unwrap();
        let record = start(
            state.clone(),
            permit,
            DeploymentRequest::new("s-1", "cluster.yml"),
        )
        .await;
        assert_eq!(record.status, DeployStatus::Started);

        let events = collect(&mut sub).await;
        let kinds: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["status", "log", "log", "status"]);

        match &events[0] {
            DeployEvent::Status(e) => assert_eq!(e.status, DeployStatus::Running),
            other => panic!("unexpected event {:?}", other),
        }
        match (&events[1], &events[2]) {
            (DeployEvent::Log(a), DeployEvent::Log(b)) => {
                assert_eq!(a.message, "PLAY [cluster.yml]");
                assert_eq!(b.message, "ok: [False]");
            }
            other => panic!("unexpected events {:?}", other),
        }
        match &events[3] {
            DeployEvent::Status(e) => {
                assert_eq!(e.status, DeployStatus::Completed);
                assert_eq!(e.exit_code, Some(0));
                assert!(e.completed_at.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }

        wait_released(&state).await;
        let stored = state.status_store.get("s-1").await.unwrap();
        assert_eq!(stored.status, DeployStatus::Completed);
        assert_eq!(stored.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_lines_keep_write_order() {
        let tmp = TempDir::new().unwrap();
        let state = state_with(
            &tmp,
            sh("i=1; while [ $i -le 300 ]; do echo \"O$i\"; echo \"E$i\" 1>&2; i=$((i+1)); done"),
        );
        let mut sub = state.event_bus.subscribe("s-1");

        let permit = state.admission.try_acquire("s-1").unwrap();
        start(state.clone(), permit, DeploymentRequest::new("s-1", "cluster.yml")).await;

        let lines: Vec<String> = collect(&mut sub)
            .await
            .into_iter()
            .filter_map(|event| match event {
                DeployEvent::Log(log) => Some(log.message),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (1..=300)
            .flat_map(|i| [format!("O{}", i), format!("E{}", i)])
            .collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let tmp = TempDir::new().unwrap();
        let state = state_with(&tmp, sh("echo boom 1>&2; exit 2"));
        let mut sub = state.event_bus.subscribe("s-1");

        let permit = state.admission.try_acquire("s-1").unwrap();
        start(state.clone(), permit, DeploymentRequest::new("s-1", "cluster.yml")).await;

        let events = collect(&mut sub).await;
        match events.last() {
            Some(DeployEvent::Status(e)) => {
                assert_eq!(e.status, DeployStatus::Failed);
                assert_eq!(e.exit_code, Some(2));
            }
            other => panic!("unexpected event {:?}", other),
        }

        wait_released(&state).await;
        assert!(state.admission.try_acquire("s-2").is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_publishes_error_then_failed() {
        let tmp = TempDir::new().unwrap();
        let state = state_with(
            &tmp,
            PlaybookCommand::new("nonexistent_playbook_runner_12345", Vec::new()),
        );
        let mut sub = state.event_bus.subscribe("s-1");

        let permit = state.admission.try_acquire("s-1").unwrap();
        start(state.clone(), permit, DeploymentRequest::new("s-1", "cluster.yml")).await;

        let events = collect(&mut sub).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DeployEvent::Error(_)));
        match &events[1] {
            DeployEvent::Status(e) => {
                assert_eq!(e.status, DeployStatus::Failed);
                assert_eq!(e.exit_code, Some(-1));
            }
            other => panic!("unexpected event {:?}", other),
        }

        wait_released(&state).await;
        let stored = state.status_store.get("s-1").await.unwrap();
        assert_eq!(stored.status, DeployStatus::Failed);
        assert_eq!(stored.exit_code, Some(-1));
    }
}
