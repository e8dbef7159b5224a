//! Validation rules shared by the event decoder and the HTTP payloads.

pub mod rules;
