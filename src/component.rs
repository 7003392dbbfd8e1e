//! Component contract and chaining.
//!
//! Every component exposes the same four entry points and forwards (or
//! rewrites) the batch to the next component in the chain. The chain
//! layout comes from the `chain.stack` config key.

use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::error::SmeltError;
use crate::instr::BhIr;

pub trait Component {
    fn init(&mut self, name: &str, cfg: &ConfigStore) -> Result<(), SmeltError>;
    fn shutdown(&mut self) -> Result<(), SmeltError>;
    fn execute(&mut self, bhir: &mut BhIr) -> Result<(), SmeltError>;
    fn extmethod(&mut self, name: &str, opcode: u32) -> Result<(), SmeltError>;
}

/// Diagnostic filter: dumps the batch (and the kernel partition when
/// already planned) to stderr, then passes it along unchanged.
#[derive(Debug, Default)]
pub struct PprintFilter {
    name: String,
}

impl Component for PprintFilter {
    fn init(&mut self, name: &str, _cfg: &ConfigStore) -> Result<(), SmeltError> {
        self.name = name.to_string();
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SmeltError> {
        Ok(())
    }

    fn execute(&mut self, bhir: &mut BhIr) -> Result<(), SmeltError> {
        eprintln!("[{}] batch of {} instruction(s)", self.name, bhir.instrs.len());
        for (i, instr) in bhir.instrs.iter().enumerate() {
            eprint!("{i:>4} {:?}", instr.opcode);
            for op in &instr.operands {
                eprint!(" {op}");
            }
            eprintln!();
        }
        for (k, kernel) in bhir.kernels.iter().enumerate() {
            eprintln!("  kernel {k}: {:?} temps {:?}", kernel.instr_idx, kernel.temps);
        }
        Ok(())
    }

    fn extmethod(&mut self, _name: &str, _opcode: u32) -> Result<(), SmeltError> {
        Ok(())
    }
}

pub fn build_component(name: &str, cfg: &ConfigStore) -> Result<Box<dyn Component>, SmeltError> {
    let mut component: Box<dyn Component> = match name {
        "engine" => Box::new(Engine::from_config(cfg)?),
        "pprint" => Box::<PprintFilter>::default(),
        other => {
            return Err(SmeltError::ComponentLoad(format!("unknown component: {other:?}").into()))
        }
    };
    component.init(name, cfg)?;
    Ok(component)
}

/// An ordered component stack; `execute` runs front to back so filters see
/// the batch before the engine consumes it.
pub struct Chain {
    components: Vec<Box<dyn Component>>,
}

impl Chain {
    pub fn from_config(cfg: &ConfigStore) -> Result<Chain, SmeltError> {
        let stack = cfg.string("chain", "stack", "engine");
        let mut components = Vec::new();
        for name in stack.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            components.push(build_component(name, cfg)?);
        }
        if components.is_empty() {
            return Err(SmeltError::Config("empty component chain".into()));
        }
        Ok(Chain { components })
    }

    pub fn execute(&mut self, bhir: &mut BhIr) -> Result<(), SmeltError> {
        for c in &mut self.components {
            c.execute(bhir)?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), SmeltError> {
        for c in &mut self.components {
            c.shutdown()?;
        }
        Ok(())
    }

    pub fn extmethod(&mut self, name: &str, opcode: u32) -> Result<(), SmeltError> {
        for c in &mut self.components {
            c.extmethod(name, opcode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_component_is_rejected() {
        let cfg = ConfigStore::empty();
        assert!(matches!(build_component("warp", &cfg), Err(SmeltError::ComponentLoad(_))));
    }

    #[test]
    fn filter_only_chain_forwards() {
        let cfg = ConfigStore::parse(r#"{"chain": {"stack": "pprint"}}"#).unwrap();
        let mut chain = Chain::from_config(&cfg).unwrap();
        let mut bhir = BhIr::new(Vec::new());
        chain.execute(&mut bhir).unwrap();
        chain.extmethod("noop", 1).unwrap();
        chain.shutdown().unwrap();
    }

    #[test]
    fn empty_chain_is_a_config_error() {
        let cfg = ConfigStore::parse(r#"{"chain": {"stack": " , "}}"#).unwrap();
        assert!(matches!(Chain::from_config(&cfg), Err(SmeltError::Config(_))));
    }
}
