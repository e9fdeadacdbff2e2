mod align;
mod allocation;
mod config;
mod device;
mod enforcer;
mod fixed_addr;
mod layout;
mod manager;
mod memory_classifier;
mod model_args;
mod policy;
mod refresh_classifier;
mod refresh_kernel;
mod remap;
mod task;

pub use align::*;
pub use allocation::*;
pub use config::*;
pub use device::*;
pub use enforcer::*;
pub use fixed_addr::*;
pub use layout::*;
pub use manager::*;
pub use memory_classifier::*;
pub use model_args::*;
pub use policy::*;
pub use refresh_classifier::*;
pub use refresh_kernel::*;
pub use remap::*;
pub use task::*;

use smallvec::SmallVec;
pub type RVec<T> = SmallVec<[T; 4]>;

//https://github.com/sonos/tract/blob/main/data/src/macros.rs#L2
#[macro_export]
macro_rules! rvec {
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::RVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ $crate::rvec![@one $x])*;
        #[allow(unused_mut)]
        let mut vec = $crate::RVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::RVec::from_vec(vec![$($x,)*])
        }
    });
}

pub mod prelude {
    pub use crate::{
        rvec, ArgsConfig, ArgsManager, ArgsTask, DeviceRuntime, ExecutionStage, Placement,
        RefreshTrigger, UpdatePolicy,
    };
}
