pub mod bundler;
pub mod config;
pub mod deps;
pub mod dev_server;
pub mod emitter;
pub mod error;
pub mod filename;
pub mod graph_builder;
pub mod html;
pub mod lint;
pub mod manifest;
pub mod module_graph;
pub mod resolver;
pub mod rules;
pub mod transform;
