//! Hostway - 最小化 PaaS 部署服务
//!
//! Usage:
//! - Normal mode: `hostway`
//! - With custom port: `hostway --port 8080`

use hostway::CliOptions;

/// 解析命令行参数
fn parse_args() -> CliOptions {
    let args: Vec<String> = std::env::args().collect();
    let mut options = CliOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                options.port_override = args[i + 1].parse().ok();
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

    options
}

fn print_help() {
    println!("Hostway - minimal PaaS deployment service");
    println!();
    println!("USAGE:");
    println!("    hostway [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    PORT, HOSTWAY_API_KEY, HOSTWAY_DATA_DIR, HOSTWAY_WORKSPACE_ROOT,");
    println!("    HOSTWAY_POLICY_FILE, GITHUB_API_URL, GITHUB_HOST, DOCKER_BIN, GIT_BIN,");
    println!("    HOSTWAY_CPU_SHARES, HOSTWAY_MEMORY_LIMIT, HOSTWAY_MAX_CONCURRENT_DEPLOYS");
}

fn main() {
    let options = parse_args();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(hostway::run(options)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
