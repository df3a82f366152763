mod pipeline;
mod query;
