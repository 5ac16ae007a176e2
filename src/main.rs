//! Kubespray Agent - 集群部署与日志推送服务
//!
//! Usage:
//! - Normal mode: `kubespray-agent`
//! - With custom port: `kubespray-agent --port 9000`

use kubespray_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                if config.port_override.is_none() {
                    eprintln!("Ignoring invalid port: {}", args[i + 1]);
                }
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Kubespray Agent - 集群部署与日志推送服务");
    println!();
    println!("USAGE:");
    println!("    kubespray-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    PORT                          Listening port (default 8080)");
    println!("    KUBESPRAY_DIR                 Kubespray checkout (default /kubespray)");
    println!("    KUBESPRAY_INVENTORY_DIR       Inventory output directory");
    println!("    KUBESPRAY_QUESTION_SETS_DIR   Question set templates directory");
    println!("    SSH_PRIVATE_KEY_PATH          SSH key for ansible (default /root/.ssh/id_rsa)");
    println!("    ANSIBLE_PLAYBOOK_CMD          Playbook command (default ansible-playbook)");
    println!("    DEPLOY_STATUS_TTL_SECS        Status retention (default 3600)");
    println!("    WS_UPSTREAM_URL               Relay WebSocket logs to this upstream");
    println!("    RUST_LOG                      Log filter");
}

fn main() -> anyhow::Result<()> {
    let config = parse_args();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(kubespray_agent::init_and_run_agent_with_config(config))
}
