//! Wire schema shared by telemetry producers and the ClickHouse writer.
//!
//! Producers serialize [`model::Event`] as JSON onto the raw events topic; the
//! writer decodes it with [`model::Event::from_slice`] and maps the free-form
//! `event_type` tag onto [`category::EventCategory`].

pub mod category;
pub mod model;
