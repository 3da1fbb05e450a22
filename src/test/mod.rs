pub mod support;
mod unit;
