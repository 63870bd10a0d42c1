//! qsched 命令行
//!
//! 主入口点：启动运行时，调整处理器数量并打印计数器

use std::env;
use std::process;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use qsched::config::{LOG_ENV, PROCS_ENV, RUNTIME_NAME, VERSION};
use qsched::runtime::{foreign_call, safepoint, SchedulerStats};
use qsched::{Runtime, RuntimeConfig};

/// 初始化日志：QSCHED_LOG 优先，其次 RUST_LOG，默认 warn
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn start_runtime() -> Runtime {
    match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn print_stats(stats: &SchedulerStats) {
    println!("procs:          {}", stats.processor_limit);
    println!("machines:       {} live / {} total", stats.live_machines, stats.total_machines);
    println!("tasks:          {} live / {} created", stats.live_tasks, stats.tasks_created);
    println!("foreign calls:  {}", stats.foreign_calls);
    println!("world pauses:   {}", stats.world_pauses);
}

/// 打印当前状态
fn show_stats() {
    let rt = start_runtime();
    println!("cpus:           {}", rt.num_cpu());
    print_stats(&rt.stats());
}

/// 修改处理器数量
fn set_procs(arg: &str) {
    let Ok(n) = arg.parse::<i64>() else {
        eprintln!("Error: invalid processor count '{}'", arg);
        process::exit(1);
    };
    let rt = start_runtime();
    let previous = rt.set_processor_limit(n);
    println!("{} -> {}", previous, rt.processor_limit());
}

/// 一边执行任务一边调整处理器数量
fn run_demo(tasks: usize) {
    let rt = Arc::new(start_runtime());
    let (tx, rx) = crossbeam_channel::unbounded();

    for i in 0..tasks {
        let tx = tx.clone();
        let spawned = rt.spawn(move || {
            let mut acc = 0u64;
            for j in 0..10_000u64 {
                acc = acc.wrapping_add(j * i as u64);
                if j % 1_000 == 0 {
                    safepoint();
                }
            }
            foreign_call(|| std::hint::black_box(acc));
            let _ = tx.send(());
        });
        if let Err(e) = spawned {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }

    let cpus = rt.num_cpu() as i64;
    for n in [1, cpus.max(2), 2, cpus] {
        let previous = rt.set_processor_limit(n);
        println!("procs {} -> {}", previous, rt.processor_limit());
    }

    for _ in 0..tasks {
        let _ = rx.recv();
    }
    rt.shutdown();
    print_stats(&rt.stats());
}

/// 打印帮助信息
fn print_help() {
    println!("Usage: {} <command>", RUNTIME_NAME);
    println!();
    println!("Commands:");
    println!("  stats          Show processor limit and counters");
    println!("  set <n>        Change the processor limit and print old -> new");
    println!("  demo [tasks]   Run tasks while changing the processor limit");
    println!("  help           Show this help message");
    println!("  version        Show version information");
    println!();
    println!("Environment:");
    println!("  {:<14} Initial processor limit (default: number of CPUs)", PROCS_ENV);
    println!("  {:<14} Log filter (falls back to RUST_LOG)", LOG_ENV);
}

/// 打印版本信息
fn print_version() {
    println!("{} {}", RUNTIME_NAME, VERSION);
}

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let remaining: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    match remaining.as_slice() {
        [] | ["stats"] => show_stats(),
        ["help"] | ["--help"] | ["-h"] => print_help(),
        ["version"] | ["--version"] | ["-v"] => print_version(),
        ["set", n] => set_procs(n),
        ["demo"] => run_demo(64),
        ["demo", n] => match n.parse() {
            Ok(tasks) => run_demo(tasks),
            Err(_) => {
                eprintln!("Error: invalid task count '{}'", n);
                process::exit(1);
            }
        },
        _ => {
            print_help();
            process::exit(1);
        }
    }
}
