//! Build, save and walk managed stacks from the command line.
//!
//! Usage:
//!   stack_explorer demo --frames 8 --deopt
//!   stack_explorer demo --relocate-after 3 --save stack.bin
//!   stack_explorer walk stack.bin --json

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use framewalk::{
    CodeCache, CodeInfo, CodeInfoTable, ContinuationFrames, DeoptimizedFrame, FrameBuffer,
    FrameInfo, FrameLayout, StackBuilder, StackSnapshot, StackWalker, StoredContinuation,
    WalkOutcome, WalkerOptions, trace,
};

const FIRST_IP: usize = 0x10_0000;
const IP_STRIDE: usize = 0x400;

#[derive(Parser, Debug)]
#[command(version, about = "Walk synthetic and saved managed stacks", long_about = None)]
#[command(name = "stack_explorer")]
struct CommandLineArguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a synthetic continuation and walk it
    Demo {
        /// Number of managed frames
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u16).range(1..))]
        frames: u16,
        /// Deoptimize the middle frame into three virtual frames
        #[arg(long, default_value_t = false, conflicts_with = "relocate_after")]
        deopt: bool,
        /// Move the continuation after this many frames were visited
        #[arg(long)]
        relocate_after: Option<usize>,
        /// Print the walk as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Save a snapshot of the continuation to this file
        #[arg(long)]
        save: Option<PathBuf>,
        /// Stop recording after this many frames
        #[arg(long, default_value_t = 1024)]
        max_frames: usize,
    },
    /// Walk a snapshot written by `demo --save`
    Walk {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(long, default_value_t = 1024)]
        max_frames: usize,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = CommandLineArguments::parse();
    trace::init();
    let options = WalkerOptions::from_env();

    let result = match args.command {
        Command::Demo {
            frames,
            deopt,
            relocate_after,
            json,
            save,
            max_frames,
        } => demo(
            options,
            frames as usize,
            deopt,
            relocate_after,
            json,
            save,
            max_frames,
        ),
        Command::Walk {
            file,
            json,
            max_frames,
        } => walk_snapshot(options, file, json, max_frames),
    };

    if trace::is_enabled() {
        let mut stderr = std::io::stderr().lock();
        trace::write_events(&mut stderr)?;
    }
    result
}

/// Frame `index` of the demo stack: the second frame is a variable-size
/// stub, the rest are regular frames of varying size.
fn demo_frame(index: usize, frames: usize) -> FrameLayout {
    let ip = FIRST_IP + index * IP_STRIDE;
    if index == 1 && frames > 2 {
        FrameLayout::VariableSize {
            ip,
            nominal_size: 32,
            extra_size: 16,
        }
    } else {
        FrameLayout::Managed {
            ip,
            size: 32 + 16 * (index % 3),
        }
    }
}

fn demo_stack(frames: usize) -> (StackBuilder, CodeInfoTable) {
    let mut builder = StackBuilder::new();
    let mut table = CodeInfoTable::new();
    for index in 0..frames {
        match demo_frame(index, frames) {
            FrameLayout::VariableSize {
                ip,
                nominal_size,
                extra_size,
            } => {
                builder = builder.variable_size(ip, nominal_size, extra_size);
                table.insert(ip, CodeInfo::variable_size_stub(nominal_size));
            }
            FrameLayout::Managed { ip, size } => {
                builder = builder.managed(ip, size);
                table.insert(
                    ip,
                    CodeInfo::regular(size).with_reference_map(index as u32),
                );
            }
            FrameLayout::Native { .. } => {}
        }
    }
    (builder, table)
}

fn demo(
    options: WalkerOptions,
    frames: usize,
    deopt: bool,
    relocate_after: Option<usize>,
    json: bool,
    save: Option<PathBuf>,
    max_frames: usize,
) -> Result<(), Box<dyn Error>> {
    let (builder, table) = demo_stack(frames);
    let (mut continuation, built) = StoredContinuation::from_builder(&builder)?;

    let mut cache = CodeCache::new(table.clone());
    if deopt {
        let middle = frames / 2;
        let layout = builder.frames()[middle];
        let method = middle as u32 * 10;
        let deoptimized = DeoptimizedFrame::new(
            layout.size(),
            layout.ip().unwrap_or(0),
            &[
                FrameInfo::new(method, 4),
                FrameInfo::new(method + 1, 12),
                FrameInfo::new(method + 2, 40),
            ],
        )
        .ok_or("deoptimized frame without virtual frames")?;
        cache
            .deoptimized
            .install(built.frame_sps[middle], deoptimized);
    }

    let walker = StackWalker::new(&cache).with_options(options);
    let mut buffer = FrameBuffer::with_capacity(max_frames);
    let outcome = match relocate_after {
        None => unsafe { walker.walk_continuation(&continuation, &mut buffer) },
        Some(after) => {
            let mut walk = unsafe { walker.initialize_for_continuation(&continuation) };
            let mut relocated = false;
            loop {
                if !relocated && buffer.len() >= after {
                    let delta = continuation.relocate()?;
                    unsafe { walk.rebase(&continuation) };
                    relocated = true;
                    if !json {
                        println!("relocated continuation by {:#x} bytes", delta);
                    }
                }
                if let Some(outcome) = walk.step(&mut buffer) {
                    break outcome;
                }
            }
        }
    };

    print_report(&buffer, outcome, json);

    if let Some(path) = save {
        StackSnapshot::capture(&continuation, &table)?.save(&path)?;
        if !json {
            println!(
                "saved snapshot of {:#x}..{:#x} to {}",
                continuation.frames_start(),
                continuation.frames_end(),
                path.display()
            );
        }
    }
    check_outcome(outcome)
}

fn walk_snapshot(
    options: WalkerOptions,
    file: PathBuf,
    json: bool,
    max_frames: usize,
) -> Result<(), Box<dyn Error>> {
    let snapshot = StackSnapshot::load(&file)?;
    let continuation = snapshot.restore()?;
    let region = continuation
        .region()
        .ok_or("snapshot restored without frames")?;

    let walker = StackWalker::new(&snapshot.code_info)
        .with_frame_access(region)
        .with_options(options);
    let mut buffer = FrameBuffer::with_capacity(max_frames);
    let outcome = unsafe { walker.walk_continuation(&continuation, &mut buffer) };

    print_report(&buffer, outcome, json);
    check_outcome(outcome)
}

fn print_report(buffer: &FrameBuffer, outcome: WalkOutcome, json: bool) {
    let report = buffer.report(outcome);
    if json {
        println!("{}", report.to_json());
    } else {
        println!("{}", report);
    }
}

fn check_outcome(outcome: WalkOutcome) -> Result<(), Box<dyn Error>> {
    match outcome.unknown_frame() {
        Some(frame) => Err(format!(
            "stack walk hit a frame of unknown code at sp={:#x} ip={:#x}",
            frame.sp, frame.ip
        )
        .into()),
        None => Ok(()),
    }
}
