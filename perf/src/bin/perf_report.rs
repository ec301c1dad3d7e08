use std::hint::black_box;
use std::time::Duration;

use tandem_icc::{Endpoint, SLOT_VERSION, bytes_for_slot};
use tandem_perf::*;

const PAYLOAD_SIZES: [usize; 4] = [8, 256, 4096, 65536];
const ROUND_TRIPS: usize = 20_000;
const WARMUP: usize = 1_000;

fn main() {
    let rusage_start = capture_rusage();
    let mut results: Vec<BenchResult> = Vec::new();

    // ═══════════════════════════════════════════════════════════════════════
    // 1. Banner
    // ═══════════════════════════════════════════════════════════════════════
    print_banner();

    // ═══════════════════════════════════════════════════════════════════════
    // 2. Same-thread handshake cost
    // ═══════════════════════════════════════════════════════════════════════
    section_local(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 3. Cross-thread round trips
    // ═══════════════════════════════════════════════════════════════════════
    section_round_trips(&mut results);

    // ═══════════════════════════════════════════════════════════════════════
    // 4. Resource Usage
    // ═══════════════════════════════════════════════════════════════════════
    let rusage_end = capture_rusage();
    section_resources(&rusage_start, &rusage_end);

    // ═══════════════════════════════════════════════════════════════════════
    // 5. JSON Output
    // ═══════════════════════════════════════════════════════════════════════
    save_results(&results, &rusage_start, &rusage_end);
}

fn print_banner() {
    let bar = "\u{2550}".repeat(90);
    println!("\n{bar}");
    println!("  TANDEM CHANNEL LATENCY REPORT");
    println!("  slot layout v{SLOT_VERSION}, header {} B", bytes_for_slot(0));
    println!("{bar}\n");

    let os = run_cmd("uname", &["-srm"]).unwrap_or_else(|| "unknown".into());
    let date = run_cmd("date", &["+%Y-%m-%d %H:%M:%S"]).unwrap_or_default();
    let ncpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(0);

    println!("  CPUs:    {ncpu}");
    println!("  OS:      {}", os.trim());
    println!("  Date:    {}", date.trim());
}

fn section_local(results: &mut Vec<BenchResult>) {
    section_header("SAME-THREAD SEND + RECEIVE (uncontended semaphores)");
    print_table_header();

    let (client_id, server_id) = unique_channel_ids("l");
    let mut server = Endpoint::init(&client_id, &server_id).expect("failed to init server");
    let mut client = Endpoint::connect(&client_id, &server_id).expect("failed to connect client");
    let payload = make_payload(64);
    let mut buf = [0u8; 64];

    let r = measure_batched("send+receive 64 B", 1_000, 100, 10, || {
        server
            .send(black_box(&payload), Duration::from_secs(1))
            .expect("send");
        black_box(client.receive(&mut buf, Duration::from_secs(1)).expect("receive"));
    });
    print_result_row(&r);
    results.push(r);

    let r = measure_batched("receive, empty, zero timeout", 1_000, 100, 10, || {
        black_box(client.receive(&mut buf, Duration::ZERO).is_err());
    });
    print_result_row(&r);
    results.push(r);
}

fn section_round_trips(results: &mut Vec<BenchResult>) {
    section_header("CROSS-THREAD ROUND TRIP (server -> echo client -> server)");
    print_table_header();

    for size in PAYLOAD_SIZES {
        let mut pair = EchoPair::start("p", size).expect("failed to start echo pair");
        let payload = make_payload(size);
        let mut reply = vec![0u8; size];

        let r = measure_each(&format!("round trip {}", format_bytes(size as u64)), ROUND_TRIPS, WARMUP, || {
            let n = pair.round_trip(&payload, &mut reply).expect("round trip");
            debug_assert_eq!(n, size);
        });
        print_result_row(&r);

        let echoed = pair.finish().expect("echo thread failed");
        assert_eq!(echoed, (ROUND_TRIPS + WARMUP) as u64, "echo thread lost messages");
        results.push(r);
    }

    if let Some(r) = results.iter().find(|r| r.name.starts_with("round trip")) {
        println!(
            "\n  Smallest payload: p50 {} / p99 {}",
            format_ns(r.stats.p50 as f64),
            format_ns(r.stats.p99 as f64),
        );
    }
}

fn section_resources(start: &ResourceSnapshot, end: &ResourceSnapshot) {
    section_header("RESOURCE USAGE");

    let delta_minor = end.minor_faults.saturating_sub(start.minor_faults);
    let delta_major = end.major_faults.saturating_sub(start.major_faults);
    let delta_vol = end.vol_ctx_switches.saturating_sub(start.vol_ctx_switches);
    let delta_invol = end
        .invol_ctx_switches
        .saturating_sub(start.invol_ctx_switches);
    let delta_user_us = end.user_time_us.saturating_sub(start.user_time_us);
    let delta_sys_us = end.sys_time_us.saturating_sub(start.sys_time_us);

    println!(
        "  Peak RSS:                    {}",
        format_bytes(end.max_rss_bytes as u64)
    );
    println!("  Minor page faults:           {}", delta_minor);
    println!("  Major page faults:           {}", delta_major);
    println!("  Voluntary ctx switches:      {}", delta_vol);
    println!("  Involuntary ctx switches:    {}", delta_invol);
    println!(
        "  User CPU time:               {:.3}s",
        delta_user_us as f64 / 1e6
    );
    println!(
        "  System CPU time:             {:.3}s",
        delta_sys_us as f64 / 1e6
    );
}

fn save_results(results: &[BenchResult], rusage_start: &ResourceSnapshot, rusage_end: &ResourceSnapshot) {
    let timestamp = run_cmd("date", &["+%Y%m%d_%H%M%S"])
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_channel.json");

    let output = serde_json::json!({
        "report_type": "channel",
        "timestamp": timestamp,
        "slot_version": SLOT_VERSION,
        "round_trips": ROUND_TRIPS,
        "benchmarks": results,
        "resources": {
            "start": rusage_start,
            "end": rusage_end,
            "delta": {
                "vol_ctx_switches": rusage_end.vol_ctx_switches.saturating_sub(rusage_start.vol_ctx_switches),
                "invol_ctx_switches": rusage_end.invol_ctx_switches.saturating_sub(rusage_start.invol_ctx_switches),
                "user_time_us": rusage_end.user_time_us.saturating_sub(rusage_start.user_time_us),
                "sys_time_us": rusage_end.sys_time_us.saturating_sub(rusage_start.sys_time_us),
            }
        },
    });

    let bar = "\u{2550}".repeat(90);
    let written = serde_json::to_string_pretty(&output)
        .map_err(std::io::Error::other)
        .and_then(|json| std::fs::write(&json_path, json));
    match written {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}

fn run_cmd(cmd: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout).ok()
            } else {
                None
            }
        })
}
