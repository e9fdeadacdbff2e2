use std::path::{Path, PathBuf};

use argtable::{
    AddressDescriptor, Allocation, ArgsConfig, ArgsManager, ArgsTask, ExecutionStage, HostDevice,
    ModelDesc, Placement, RVec, RefreshTrigger, RemapReport, SlotRef, SlotTableTask,
    StaticTaskGraph, Stream, TaskArgsDesc, TaskKind, TaskRunParam, TensorOccupancy, UpdatePolicy,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Deserialize;
use strum::IntoEnumIterator;
use tabled::settings::{object::Rows, Alignment, Modify, Panel, Style};
use tabled::{Table, Tabled};

pub fn start_logger(level: log::LevelFilter) {
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();
    match logger {
        Ok(_) => log::info!("Logging initialized."),
        Err(error) => eprintln!("Error initializing logging: {:?}", error),
    }
}

#[derive(Debug, Deserialize)]
struct TaskDef {
    kind: TaskKind,
    #[serde(default)]
    op_index: Option<usize>,
    #[serde(default)]
    inputs: Vec<AddressDescriptor>,
    #[serde(default)]
    outputs: Vec<AddressDescriptor>,
    #[serde(default)]
    workspaces: Vec<AddressDescriptor>,
    #[serde(default)]
    args: Vec<TaskArgsDesc>,
    #[serde(default)]
    persistent_workspaces: Vec<TaskArgsDesc>,
    #[serde(default)]
    scalars: Vec<u8>,
}

impl TaskDef {
    fn into_task(self) -> Box<dyn ArgsTask> {
        let param = TaskRunParam {
            inputs: RVec::from_vec(self.inputs),
            outputs: RVec::from_vec(self.outputs),
            workspaces: RVec::from_vec(self.workspaces),
            args_descs: RVec::from_vec(self.args),
            persistent_workspace_descs: RVec::from_vec(self.persistent_workspaces),
        };
        Box::new(SlotTableTask::new(
            self.kind,
            self.op_index,
            param,
            self.scalars,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct PinDef {
    slot: SlotRef,
    peers: Vec<SlotRef>,
    size: u64,
}

/// A model as described on disk: the allocation table, the tasks and the pinned edges of the
/// graph.
#[derive(Debug, Deserialize)]
struct ModelFile {
    allocations: Vec<Allocation>,
    #[serde(default)]
    fusion_start_id: Option<usize>,
    #[serde(default)]
    host_input_size: u64,
    #[serde(default)]
    tensor_occupancy: Vec<TensorOccupancy>,
    tasks: Vec<TaskDef>,
    #[serde(default)]
    pinned: Vec<PinDef>,
}

impl ModelFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let reader = std::io::BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn logical_bases(&self) -> Vec<u64> {
        self.allocations.iter().map(|a| a.logical_addr).collect()
    }

    fn into_parts(self) -> (ModelDesc, Vec<Box<dyn ArgsTask>>, StaticTaskGraph) {
        let mut graph = StaticTaskGraph::new(self.tasks.iter().map(|t| t.kind).collect());
        for pin in self.pinned {
            graph.pin(pin.slot, RVec::from_vec(pin.peers), pin.size);
        }
        let tasks = self.tasks.into_iter().map(TaskDef::into_task).collect();
        let desc = ModelDesc::new(
            self.allocations,
            self.fusion_start_id,
            self.host_input_size,
            self.tensor_occupancy,
        );
        (desc, tasks, graph)
    }
}

/// A loaded model, its tables initialised against its logical addresses.
struct Session {
    device: HostDevice,
    manager: ArgsManager<HostDevice>,
    bases: Vec<u64>,
    host_input: Option<Vec<u8>>,
    stream: Stream,
}

impl Session {
    fn load(matches: &ArgMatches) -> anyhow::Result<Self> {
        let model = matches
            .get_one::<PathBuf>("model")
            .ok_or_else(|| anyhow::anyhow!("Model file not provided"))?;
        let config = match matches.get_one::<PathBuf>("config") {
            Some(path) => {
                let reader = std::io::BufReader::new(std::fs::File::open(path)?);
                serde_json::from_reader::<_, ArgsConfig>(reader)?.with_env_overrides()
            }
            None => ArgsConfig::from_env(),
        };
        log::info!("Using {:?}", config);

        let file = ModelFile::load(model)?;
        let bases = file.logical_bases();
        let host_input = (file.host_input_size > 0).then(|| vec![0u8; file.host_input_size as usize]);
        let (desc, tasks, graph) = file.into_parts();

        let device = HostDevice::new();
        let mut manager = ArgsManager::init(device.clone(), config, desc, tasks, &graph)?;
        let stream = Stream::new(0);
        manager.update_for_execute(
            &bases,
            host_input.as_deref(),
            None,
            &stream,
            ExecutionStage::Load,
        )?;
        Ok(Self {
            device,
            manager,
            bases,
            host_input,
            stream,
        })
    }
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn parse_rebase(s: &str) -> Result<(usize, u64), String> {
    let (row, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ROW=ADDR, got '{}'", s))?;
    let row = row
        .parse()
        .map_err(|e| format!("invalid row '{}': {}", row, e))?;
    Ok((row, parse_addr(addr)?))
}

fn styled(table: &mut Table, footer: String) -> Table {
    table
        .with(Style::modern())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .with(Modify::new(Rows::new(1..)).with(Alignment::left()))
        .with(Panel::footer(footer))
        .to_owned()
}

#[derive(Tabled)]
struct LayoutTableEntry {
    #[tabled(rename = "Task")]
    task: usize,
    #[tabled(rename = "Region")]
    region: usize,
    #[tabled(rename = "Declared")]
    declared: Placement,
    #[tabled(rename = "Stored In")]
    placement: Placement,
    #[tabled(rename = "Trigger")]
    trigger: RefreshTrigger,
    #[tabled(rename = "Offset")]
    offset: u64,
    #[tabled(rename = "Length")]
    len: u64,
}

fn build_layout_table(manager: &ArgsManager<HostDevice>) -> Table {
    let layout = manager.layout();
    let entries: Vec<LayoutTableEntry> = layout
        .tasks
        .iter()
        .enumerate()
        .flat_map(|(task, entries)| {
            entries.iter().enumerate().map(move |(region, e)| LayoutTableEntry {
                task,
                region,
                declared: e.declared,
                placement: e.placement,
                trigger: e.trigger,
                offset: e.offset,
                len: e.len,
            })
        })
        .collect();
    let footer = match layout.host_input {
        Some(h) => format!("host input: {} bytes at {} offset {}", h.len, h.placement, h.offset),
        None => "no host input".to_string(),
    };
    styled(&mut Table::new(&entries), footer)
}

#[derive(Tabled)]
struct PartitionTableEntry {
    #[tabled(rename = "Placement")]
    placement: Placement,
    #[tabled(rename = "Trigger")]
    trigger: RefreshTrigger,
    #[tabled(rename = "Start")]
    start: u64,
    #[tabled(rename = "Length")]
    len: u64,
    #[tabled(rename = "Padding")]
    pad: u64,
}

fn build_partition_table(manager: &ArgsManager<HostDevice>) -> Table {
    let partitions = &manager.layout().partitions;
    let mut entries = vec![];
    for placement in partitions.non_empty_placements() {
        for trigger in RefreshTrigger::iter() {
            let partition = partitions.get(placement, trigger);
            if partition.is_empty() {
                continue;
            }
            entries.push(PartitionTableEntry {
                placement,
                trigger,
                start: partitions.partition_start(placement, trigger),
                len: partition.len,
                pad: partition.align_pad,
            });
        }
    }
    let total: u64 = Placement::iter()
        .map(|p| partitions.placement_len(p))
        .sum();
    styled(&mut Table::new(&entries), format!("{} bytes total", total))
}

#[derive(Tabled)]
struct PolicyTableEntry {
    #[tabled(rename = "Policy")]
    policy: UpdatePolicy,
    #[tabled(rename = "Refreshed Tasks")]
    tasks: String,
    #[tabled(rename = "Copies")]
    copies: String,
    #[tabled(rename = "SQE Updates")]
    sqe_updates: usize,
}

fn build_policy_table(manager: &ArgsManager<HostDevice>) -> Table {
    let entries: Vec<PolicyTableEntry> = manager
        .policy_table()
        .iter()
        .map(|(policy, entry)| PolicyTableEntry {
            policy,
            tasks: format!("{:?}", entry.refresh.iter().map(|r| r.task_index).collect::<Vec<_>>()),
            copies: entry
                .copies
                .iter()
                .map(|c| format!("{} {}..{}", c.placement, c.range.start, c.range.end))
                .collect::<Vec<_>>()
                .join(", "),
            sqe_updates: entry.sqe_updates.len(),
        })
        .collect();
    let footer = match manager.kernel_tiling() {
        Some(tiling) => format!(
            "refresh kernel: {} cores, {} entries per tile",
            tiling.cores, tiling.tile
        ),
        None => "refresh kernel: off".to_string(),
    };
    styled(&mut Table::new(&entries), footer)
}

#[derive(Tabled)]
struct OverlapTableEntry {
    #[tabled(rename = "Allocation")]
    allocation: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Absolute")]
    absolute: bool,
}

fn build_remap_table(report: &RemapReport) -> Table {
    let entries: Vec<OverlapTableEntry> = report
        .overlaps
        .iter()
        .map(|o| OverlapTableEntry {
            allocation: format!("{:?}", o.alloc_id),
            range: format!("{:#x}..{:#x}", o.range.start, o.range.end),
            absolute: o.absolute,
        })
        .collect();
    styled(&mut Table::new(&entries), format!("{}", report.result))
}

#[derive(Tabled)]
struct OpTableEntry {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Device Op")]
    op: String,
}

fn handle_plan(matches: &ArgMatches) -> anyhow::Result<()> {
    let session = Session::load(matches)?;
    println!("{}", build_layout_table(&session.manager));
    println!("{}", build_partition_table(&session.manager));
    println!("{}", build_policy_table(&session.manager));
    Ok(())
}

fn handle_execute(matches: &ArgMatches) -> anyhow::Result<()> {
    let mut session = Session::load(matches)?;
    session.device.clear_ops();

    let mut bases = session.bases.clone();
    if let Some(rebases) = matches.get_many::<(usize, u64)>("rebase") {
        for &(row, addr) in rebases {
            let base = bases
                .get_mut(row)
                .ok_or_else(|| anyhow::anyhow!("Allocation row {} does not exist", row))?;
            *base = addr;
        }
    }
    let hint = matches.get_one::<UpdatePolicy>("hint").copied();

    let policy = session.manager.update_for_execute(
        &bases,
        session.host_input.as_deref(),
        hint,
        &session.stream,
        ExecutionStage::Run,
    )?;
    let ops: Vec<OpTableEntry> = session
        .device
        .ops()
        .into_iter()
        .enumerate()
        .map(|(index, op)| OpTableEntry {
            index,
            op: format!("{:?}", op),
        })
        .collect();
    println!("{}", styled(&mut Table::new(&ops), format!("{} applied", policy)));
    Ok(())
}

fn handle_remap(matches: &ArgMatches) -> anyhow::Result<()> {
    let session = Session::load(matches)?;
    let va = *matches
        .get_one::<u64>("va")
        .ok_or_else(|| anyhow::anyhow!("Virtual address not provided"))?;
    let len = *matches
        .get_one::<u64>("len")
        .ok_or_else(|| anyhow::anyhow!("Length not provided"))?;
    let pa = matches.get_one::<u64>("pa").copied().unwrap_or(0);
    let report = session.manager.pa_remapped(va, pa, len);
    println!("{}", build_remap_table(&report));
    Ok(())
}

fn model_args() -> [Arg; 2] {
    [
        Arg::new("model")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help("Path to the model description (JSON)."),
        Arg::new("config")
            .short('c')
            .long("config")
            .value_parser(value_parser!(PathBuf))
            .help("Path to an argument manager config (JSON)."),
    ]
}

fn cli() -> Command {
    Command::new("argtable")
        .about("Plan and exercise task argument tables")
        .version("0.1.0")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Raise the log level, repeat for more."),
        )
        .subcommand(
            Command::new("plan")
                .long_about("Prints the argument layout, partitions and update policy table.")
                .args(model_args()),
        )
        .subcommand(
            Command::new("execute")
                .long_about(
                    "Loads the model, moves allocations to new bases and runs one update.",
                )
                .args(model_args())
                .arg(
                    Arg::new("rebase")
                        .short('r')
                        .long("rebase")
                        .action(ArgAction::Append)
                        .value_parser(parse_rebase)
                        .help("New active base for an allocation row, as ROW=ADDR."),
                )
                .arg(
                    Arg::new("hint")
                        .long("hint")
                        .value_parser(|s: &str| {
                            UpdatePolicy::iter()
                                .find(|p| p.to_string() == s)
                                .ok_or_else(|| format!("unknown policy '{}'", s))
                        })
                        .help("Minimum update policy to apply."),
                ),
        )
        .subcommand(
            Command::new("remap")
                .long_about("Reports which tensors a physical page remap would affect.")
                .args(model_args())
                .arg(
                    Arg::new("va")
                        .long("va")
                        .required(true)
                        .value_parser(parse_addr)
                        .help("Start of the remapped virtual range."),
                )
                .arg(
                    Arg::new("len")
                        .long("len")
                        .required(true)
                        .value_parser(parse_addr)
                        .help("Length of the remapped range."),
                )
                .arg(
                    Arg::new("pa")
                        .long("pa")
                        .value_parser(parse_addr)
                        .help("New physical address."),
                ),
        )
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    start_logger(level);

    match matches.subcommand() {
        Some(("plan", matches)) => handle_plan(matches),
        Some(("execute", matches)) => handle_execute(matches),
        Some(("remap", matches)) => handle_remap(matches),
        _ => unreachable!("subcommand_required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../../models/two_stage.json");

    #[test]
    fn addresses_accept_hex_and_decimal() {
        assert_eq!(parse_addr("0x1000"), Ok(0x1000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xzz").is_err());
        assert_eq!(parse_rebase("1=0x8000"), Ok((1, 0x8000)));
        assert!(parse_rebase("1:0x8000").is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn sample_model_plans() -> anyhow::Result<()> {
        let file: ModelFile = serde_json::from_str(SAMPLE)?;
        let bases = file.logical_bases();
        let (desc, tasks, graph) = file.into_parts();
        let config = ArgsConfig {
            kernel_refresh: false,
            ..Default::default()
        };
        let mut manager = ArgsManager::init(HostDevice::new(), config, desc, tasks, &graph)?;
        let policy = manager.update_for_execute(
            &bases,
            Some(&[0u8; 16][..]),
            None,
            &Stream::new(0),
            ExecutionStage::Load,
        )?;
        assert_eq!(policy, UpdatePolicy::InitOneTime);
        assert_eq!(manager.layout().host_input.map(|h| h.offset), Some(192));

        let table = build_policy_table(&manager).to_string();
        assert!(table.contains("UpdateFmAndModelIO"));
        Ok(())
    }
}
