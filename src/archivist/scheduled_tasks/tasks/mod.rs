mod harvest;

pub use harvest::{HarvestKind, HarvestTask, Harvester};
