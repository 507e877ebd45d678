use clap::Parser;
use log::{debug, error, info};
use mipsevm64::{
    cannon::{self, Meta, Start, VmConfiguration},
    cli, elf_loader,
    interpreters::mips::witness::Env,
    preimage_oracle::{NullPreImageOracle, PreImageOracle, PreImageOracleT},
    state::State,
    utils,
};
use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
    process::ExitCode,
};

fn gen_state_json(args: cli::GenStateJsonArgs) -> Result<(), String> {
    let state = elf_loader::parse_elf(Path::new(&args.input))
        .map_err(|e| format!("Error loading ELF file {}: {e}", args.input))?;
    let file = File::create(&args.output).expect("Error creating output state file");
    serde_json::to_writer_pretty(file, &state).expect("Error writing output state file");
    info!("Wrote initial state to {}", args.output);
    Ok(())
}

fn pp_info(env: &Env<Box<dyn PreImageOracleT>>, meta: &Option<Meta>, start: &Start) {
    let step = env.state.step;
    let pc = env.state.current_thread().cpu.pc;
    let insn = env.state.memory.get_u32(pc).unwrap_or(0);

    let elapsed = start.time.elapsed();
    let how_many_steps = step as usize - start.step;
    let ips = how_many_steps as f64 / elapsed.as_secs_f64();

    let pages = env.state.memory.page_count();
    let mem = utils::human_bytes(pages * cannon::PAGE_SIZE as usize);
    let name = meta
        .as_ref()
        .and_then(|m| m.find_address_symbol(pc))
        .unwrap_or("n/a".to_string());

    info!(
        "processing step={} pc={:010x} insn={:010x} ips={:.2} pages={} mem={} name={}",
        step, pc, insn, ips, pages, mem, name
    );
}

fn run(configuration: VmConfiguration) -> Result<(), String> {
    // Read the JSON contents of the input file as a State.
    let state: State = {
        let file = File::open(&configuration.input_state_file)
            .expect("Error opening input state file ");
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).expect("Error reading input state file")
    };

    let start = Start::create(state.step as usize);

    let meta: Option<Meta> = configuration.metadata_file.as_ref().map(|f| {
        let meta_file =
            File::open(f).unwrap_or_else(|_| panic!("Could not open metadata file {}", f));
        serde_json::from_reader(BufReader::new(meta_file))
            .unwrap_or_else(|_| panic!("Error deserializing metadata file {}", f))
    });

    let mut env: Env<Box<dyn PreImageOracleT>> = match configuration.host.clone() {
        Some(host) => {
            let mut po = PreImageOracle::create(host);
            let _child = po.start();
            Env::create(
                state,
                Box::new(po),
                Box::new(io::stdout()),
                Box::new(io::stderr()),
            )
        }
        None => {
            debug!("No preimage oracle provided 🤞");
            // warning: the null preimage oracle has no data and will fail the
            // program on the first preimage request
            Env::create(
                state,
                Box::new(NullPreImageOracle),
                Box::new(io::stdout()),
                Box::new(io::stderr()),
            )
        }
    };

    while !env.state.exited {
        let step = env.state.step;

        if configuration.info_at.should_trigger_at(step) {
            pp_info(&env, &meta, &start);
        }
        if configuration.snapshot_state_at.should_trigger_at(step) {
            let filename = configuration.snapshot_fmt.replace("%d", &step.to_string());
            let file = File::create(&filename).expect("Impossible to open snapshot file");
            serde_json::to_writer(file, &env.state).expect("Error writing snapshot file");
            info!("Snapshot state in {}, step {}", filename, step);
        }

        let produce_witness = configuration.proof_at.should_trigger_at(step);
        match env.step(produce_witness) {
            Ok(Some(witness)) => {
                let filename = configuration.proof_fmt.replace("%d", &step.to_string());
                let file = File::create(&filename).expect("Impossible to open proof file");
                serde_json::to_writer(file, &witness).expect("Error writing proof file");
                info!("Wrote step proof to {}", filename);
            }
            Ok(None) => (),
            Err(e) => {
                error!("VM error at step {}: {e}", env.state.step);
                return Err(format!("VM error at step {}: {e}", env.state.step));
            }
        }

        if configuration.stop_at.should_trigger_at(env.state.step) {
            info!("Halted as requested at step={}", env.state.step);
            break;
        }
        if let Some(halt_address) = configuration.halt_address {
            if env.state.current_thread().cpu.pc == halt_address {
                debug!("Program jumped to halt address {:#x}", halt_address);
                break;
            }
        }
    }

    if env.state.exited {
        info!(
            "Exited with code {} at step {}",
            env.state.exit_code, env.state.step
        );
    }

    let file = File::create(&configuration.output_state_file)
        .expect("Error creating output state file");
    serde_json::to_writer_pretty(file, &env.state).expect("Error writing output state file");

    Ok(())
}

pub fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cli::Cli::parse();
    let result = match args.command {
        cli::Commands::Run(args) => run(args.vm_cfg.into()),
        cli::Commands::GenStateJson(args) => gen_state_json(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
