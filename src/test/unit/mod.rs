mod context;
mod image;
