use log::{error, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use super::config::AppConfig;
use super::program::{dump_regions, Program};
use super::sim::mode::{SimConfig, StepMode, TargetSource};
use super::sim::records::InstRecord;
use super::sim::shell::{Command, Shell};
use super::utils::log::set_log;
use crate::arch::dpu::{Dpu, Instruction, Sequencer};
use crate::arch::profile::{Generation, Profile};
use crate::error::Result;
use crate::{inst_record, log_info};

pub struct Simulator {
  config: SimConfig,
  sequencer: Sequencer,
  instructions: Vec<Instruction>,
  pc: usize,
  records: Vec<InstRecord>,
}

impl Simulator {
  pub fn new(config: SimConfig, program: Program) -> Result<Self> {
    let profile = match &config.target {
      TargetSource::Builtin(name) => Profile::builtin(Generation::from_name(name)?),
      TargetSource::File(path) => Profile::from_toml_file(path)?,
    };
    let mut dpu = Dpu::new(profile, config.dpu)?;
    program.apply(&mut dpu)?;
    info!(
      "{}: {} instructions, {} regions",
      dpu.profile.name,
      program.instructions.len(),
      program.regions.len()
    );
    Ok(Self {
      config,
      sequencer: Sequencer::new(dpu),
      instructions: program.instructions,
      pc: 0,
      records: Vec::new(),
    })
  }

  pub fn from_app_config(app_config: &AppConfig, program_path: &Path) -> Result<Self> {
    Self::new(app_config.to_sim_config(), Program::from_file(program_path)?)
  }

  pub fn sequencer(&self) -> &Sequencer {
    &self.sequencer
  }

  pub fn records(&self) -> &[InstRecord] {
    &self.records
  }

  /// Stream exhausted or END reached.
  pub fn is_finished(&self) -> bool {
    self.pc >= self.instructions.len() || self.sequencer.is_ended()
  }

  pub fn run(&mut self) -> Result<()> {
    set_log(!self.config.quiet);
    let res = match self.config.step_mode {
      StepMode::Continuous => self.run_continuous(),
      StepMode::Step => self.run_step_mode(),
    };
    if let Err(e) = &res {
      error!("{}", e);
    }
    // trace and regions are written even after a fatal error
    self.finish()?;
    res
  }

  fn run_continuous(&mut self) -> Result<()> {
    log_info!("Continuous mode");
    while self.step()? {}
    log_info!("{} instructions executed", self.pc);
    Ok(())
  }

  fn run_step_mode(&mut self) -> Result<()> {
    log_info!("Step mode - Press Enter to step, 'c' to continue, 'q' to quit");
    let mut shell = Shell::new()?;
    while !self.is_finished() {
      match shell.read_command()? {
        Command::Step(n) => {
          for _ in 0..n {
            if !self.step()? {
              break;
            }
          }
        },
        Command::Continue => return self.run_continuous(),
        Command::Examine { bank, addr, count } => self.examine(bank, addr, count),
        Command::Quit => break,
      }
    }
    Ok(())
  }

  fn examine(&self, bank: u32, addr: usize, count: usize) {
    match self.sequencer.dpu().banks.get(bank).and_then(|b| b.read_vec(addr, count)) {
      Ok(data) => println!("bank {} @ {}: {:?}", bank, addr, data),
      Err(e) => eprintln!("Error: {}", e),
    }
  }

  /// Issue the next instruction; `false` once nothing is left to run.
  pub fn step(&mut self) -> Result<bool> {
    if self.is_finished() {
      return Ok(false);
    }
    let inst = &self.instructions[self.pc];
    let executed = self.sequencer.issue(inst)?;
    log_info!("[{}] #{} {} {}", self.pc, executed.id, executed.opcode, executed.summary);
    inst_record!(self.records, self.pc, executed);
    self.pc += 1;
    Ok(!self.is_finished())
  }

  fn finish(&self) -> Result<()> {
    if let Some(path) = &self.config.trace_file {
      let mut w = BufWriter::new(File::create(path)?);
      for r in &self.records {
        serde_json::to_writer(&mut w, r)?;
        writeln!(w)?;
      }
      w.flush()?;
      info!("trace: {} records -> {:?}", self.records.len(), path);
    }
    if let Some(path) = &self.config.output_file {
      fs::write(path, serde_json::to_string_pretty(&dump_regions(self.sequencer.dpu()))?)?;
      info!("regions -> {:?}", path);
    }
    Ok(())
  }
}
