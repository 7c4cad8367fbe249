//! Disruptive-change classification
//!
//! A running Locust cluster cannot absorb a new image, script, argument list
//! or environment through a rolling update: workers from the old generation
//! would keep reporting to a fresh master. Changes to these regions of the
//! spec therefore tear both Deployments down before they are recreated.
//! Worker replica count is not a region; scaling is always in place.

use std::fmt;

use locust_common::crd::RunSpec;

/// Top-level spec region whose change forces a restart
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpecRegion {
    Image,
    WorkerImage,
    ExtraArgs,
    Env,
    /// Master pod overlay, including master resources
    MasterPod,
    /// Worker pod overlay, including worker resources
    WorkerPod,
    Locustfile,
}

impl SpecRegion {
    /// Every region, in reporting order
    pub const ALL: [SpecRegion; 7] = [
        SpecRegion::Image,
        SpecRegion::WorkerImage,
        SpecRegion::ExtraArgs,
        SpecRegion::Env,
        SpecRegion::MasterPod,
        SpecRegion::WorkerPod,
        SpecRegion::Locustfile,
    ];

    /// Spec field name shown to users
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecRegion::Image => "image",
            SpecRegion::WorkerImage => "workerImage",
            SpecRegion::ExtraArgs => "extraArgs",
            SpecRegion::Env => "env",
            SpecRegion::MasterPod => "master",
            SpecRegion::WorkerPod => "worker",
            SpecRegion::Locustfile => "locustfile",
        }
    }

    fn differs(&self, old: &RunSpec, new: &RunSpec) -> bool {
        match self {
            SpecRegion::Image => old.image != new.image,
            // An unset worker image follows `image` and is reported there
            SpecRegion::WorkerImage => {
                old.worker_image() != new.worker_image()
                    && (old.worker_image.is_some() || new.worker_image.is_some())
            }
            SpecRegion::ExtraArgs => old.extra_args != new.extra_args,
            SpecRegion::Env => old.env != new.env,
            SpecRegion::MasterPod => {
                old.master != new.master || old.master_resources != new.master_resources
            }
            SpecRegion::WorkerPod => {
                old.worker != new.worker || old.worker_resources != new.worker_resources
            }
            SpecRegion::Locustfile => old.script != new.script,
        }
    }
}

impl fmt::Display for SpecRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regions that differ between two specs, in reporting order
pub fn changed_regions(old: &RunSpec, new: &RunSpec) -> Vec<SpecRegion> {
    SpecRegion::ALL
        .into_iter()
        .filter(|region| region.differs(old, new))
        .collect()
}

/// True if moving from `old` to `new` requires recreating master and workers
pub fn restart_required(old: &RunSpec, new: &RunSpec) -> bool {
    SpecRegion::ALL
        .iter()
        .any(|region| region.differs(old, new))
}
