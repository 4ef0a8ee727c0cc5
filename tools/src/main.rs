//! spine-runner: headless TimeSpine runner over the sandbox settlement.
//!
//! Usage:
//!   spine-runner --seed 12345 --ticks 200 --db run.db
//!   spine-runner --seed 12345 --ipc-mode
//!
//! In IPC mode the runner reads one JSON request per line on stdin and
//! answers with one JSON line on stdout.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{self, BufRead, Write};
use timespine_core::{
    branch::{BranchPriority, BranchState},
    command::{ComparisonRequest, SpineCommand},
    engine::SpineEngine,
    merge::BranchMergeRequest,
    modification::{EntityRef, WhatIfModification},
    sandbox::GOLD,
    scenario::{ScenarioPoll, WhatIfRequest},
    snapshot::AggregateMetrics,
    store::SpineStore,
    types::{BranchId, Tick, MAIN_BRANCH_ID},
};

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    GetState,
    Tick {
        count: u64,
    },
    CreateBranch {
        #[serde(default = "main_id")]
        parent_id: BranchId,
        #[serde(default)]
        priority:  Option<BranchPriority>,
    },
    Destroy {
        branch_id: BranchId,
    },
    Freeze {
        branch_id: BranchId,
    },
    Submit {
        request:       WhatIfRequest,
        #[serde(default)]
        modifications: Vec<WhatIfModification>,
    },
    Poll {
        branch_id: BranchId,
    },
    Compare(ComparisonRequest),
    Merge(BranchMergeRequest),
    Queue {
        command: SpineCommand,
    },
    CommandOutcome {
        command_id: String,
    },
    Quit,
}

fn main_id() -> BranchId {
    MAIN_BRANCH_ID.to_string()
}

#[derive(Serialize)]
struct BranchRow {
    branch_id:         BranchId,
    parent_id:         Option<BranchId>,
    state:             BranchState,
    priority:          BranchPriority,
    branch_point_tick: Tick,
    current_tick:      Tick,
    divergence:        f64,
    entity_count:      usize,
    metrics:           AggregateMetrics,
}

#[derive(Serialize)]
struct UiState {
    tick:     Tick,
    paused:   bool,
    branches: Vec<BranchRow>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let ticks = parse_arg(&args, "--ticks", 200u64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = string_arg(&args, "--db", ":memory:");
    let data_dir = string_arg(&args, "--data-dir", "./data");

    if !ipc_mode {
        println!("TimeSpine spine-runner");
        println!("  seed:      {seed}");
        println!("  ticks:     {ticks}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    let store = SpineStore::open(db)?;
    store.migrate()?;

    let run_id = format!("run-{seed}-{}", chrono::Utc::now().timestamp());
    store.insert_run(&run_id, seed, env!("CARGO_PKG_VERSION"))?;

    let mut engine = SpineEngine::build(run_id.clone(), seed, store, data_dir)?;

    if ipc_mode {
        run_ipc_loop(&mut engine)?;
    } else {
        run_demo(&mut engine, ticks)?;
        print_summary(&engine, &run_id)?;
    }
    Ok(())
}

/// Run half the ticks, fork two scenarios off the main timeline, then
/// run the rest so both can finish.
fn run_demo(engine: &mut SpineEngine, ticks: u64) -> Result<()> {
    let warmup = ticks / 2;
    engine.run_ticks(warmup)?;

    let start = engine.current_tick();
    let horizon = (ticks - warmup).max(1);
    let treasury = EntityRef::Origin(1);

    let mut windfall = WhatIfRequest::new("windfall", start, horizon);
    windfall.auto_merge_if_better = true;
    let windfall_id =
        engine.submit_scenario(windfall, &[WhatIfModification::set_resource(treasury.clone(), GOLD, 5_000.0)])?;

    let mut austerity = WhatIfRequest::new("austerity", start, horizon);
    austerity.preserve_after_complete = true;
    let austerity_id =
        engine.submit_scenario(austerity, &[WhatIfModification::set_resource(treasury, GOLD, 0.0)])?;

    log::info!("demo scenarios started: {windfall_id}, {austerity_id}");
    engine.run_ticks(ticks - warmup)?;
    Ok(())
}

fn run_ipc_loop(engine: &mut SpineEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let request: IpcRequest = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(request, IpcRequest::Quit) {
            break;
        }

        let response = match handle_request(engine, request) {
            Ok(value) => serde_json::json!({ "ok": value }),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_request(engine: &mut SpineEngine, request: IpcRequest) -> Result<serde_json::Value> {
    let value = match request {
        IpcRequest::GetState | IpcRequest::Quit => serde_json::to_value(build_ui_state(engine)?)?,
        IpcRequest::Tick { count } => {
            engine.run_ticks(count)?;
            serde_json::to_value(build_ui_state(engine)?)?
        }
        IpcRequest::CreateBranch { parent_id, priority } => {
            let branch_point = engine.branch(&parent_id)?.current_tick();
            let branch_id = engine.create_branch(
                &parent_id,
                branch_point,
                priority.unwrap_or(BranchPriority::Normal),
            )?;
            serde_json::json!({ "branch_id": branch_id })
        }
        IpcRequest::Destroy { branch_id } => {
            engine.destroy_branch(&branch_id)?;
            serde_json::json!({ "destroyed": branch_id })
        }
        IpcRequest::Freeze { branch_id } => {
            let changed = engine.freeze_branch(&branch_id)?;
            serde_json::json!({ "frozen": branch_id, "changed": changed })
        }
        IpcRequest::Submit { request, modifications } => {
            let branch_id = engine.submit_scenario(request, &modifications)?;
            serde_json::json!({ "branch_id": branch_id })
        }
        IpcRequest::Poll { branch_id } => match engine.poll_result(&branch_id)? {
            ScenarioPoll::Pending => serde_json::json!({ "status": "pending" }),
            ScenarioPoll::Abandoned => serde_json::json!({ "status": "abandoned" }),
            ScenarioPoll::Complete(result) => {
                serde_json::json!({ "status": "complete", "result": result })
            }
        },
        IpcRequest::Compare(request) => serde_json::to_value(engine.request_comparison(&request)?)?,
        IpcRequest::Merge(request) => serde_json::to_value(engine.request_merge(&request)?)?,
        IpcRequest::Queue { command } => {
            let command_id = engine.submit_command(command)?;
            serde_json::json!({ "command_id": command_id })
        }
        IpcRequest::CommandOutcome { command_id } => {
            serde_json::to_value(engine.command_outcome(&command_id))?
        }
    };
    Ok(value)
}

fn build_ui_state(engine: &SpineEngine) -> Result<UiState> {
    let mut branches = Vec::new();
    for branch in engine.registry().branches() {
        let snapshot = engine.snapshot(&branch.id)?;
        branches.push(BranchRow {
            branch_id:         branch.id.clone(),
            parent_id:         branch.parent_id.clone(),
            state:             branch.state(),
            priority:          branch.priority,
            branch_point_tick: branch.branch_point_tick,
            current_tick:      branch.current_tick(),
            divergence:        branch.divergence_score(),
            entity_count:      snapshot.entity_count,
            metrics:           snapshot.metrics,
        });
    }
    Ok(UiState { tick: engine.current_tick(), paused: engine.clock.paused, branches })
}

fn print_summary(engine: &SpineEngine, run_id: &str) -> Result<()> {
    let main = engine.snapshot(MAIN_BRANCH_ID)?;

    println!("=== RUN SUMMARY ===");
    println!("  run_id:         {run_id}");
    println!("  final tick:     {}", engine.current_tick());
    println!("  live branches:  {}", engine.registry().len());
    println!("  main entities:  {}", main.entity_count);
    println!("  population:     {:.0}", main.metrics.population);
    println!("  resources:      {:.1}", main.metrics.resources);
    println!("  happiness:      {:.3}", main.metrics.happiness);
    println!("  military:       {:.1}", main.metrics.military);
    println!("  merges:         {}", engine.store_event_count("merge_completed")?);
    println!("  pruned:         {}", engine.store_event_count("branch_pruned")?);

    println!();
    println!("=== WHAT-IF RESULTS ===");
    let results = engine.store.what_if_results(run_id)?;
    if results.is_empty() {
        println!("  (No scenarios completed yet)");
    }
    for result in results {
        println!(
            "  {:<12} | {} | score {:>9.3} | divergence {:.3} | {}",
            result.scenario_name,
            result.branch_id,
            result.overall_score,
            result.divergence,
            if result.merge.is_some() {
                "merged"
            } else if result.is_better_than_baseline {
                "better"
            } else {
                "worse"
            }
        );
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str, default: &'a str) -> &'a str {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .unwrap_or(default)
}
