// Domain Model - spools, unions and the people who work on them
//
// Everything here is plain data. Decoding from store rows lives in
// `store::schema`, lifecycle rules live in `workflows`.

pub mod unit;

pub use unit::{
    ActorId, Claimant, Completion, Operation, ParseOperationError, SubUnit, UnitTag, VersionToken,
    WorkUnit,
};
