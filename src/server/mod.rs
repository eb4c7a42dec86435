pub mod guards;
pub mod router;

pub use router::{CastorState, castor_router};
