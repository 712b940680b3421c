/// Key/value state attached to job and step executions.
pub mod context;

pub mod execution;

pub mod job;

pub mod launcher;

/// Name and id based job control.
pub mod operator;

pub mod parameters;

pub mod repository;

pub mod step;
