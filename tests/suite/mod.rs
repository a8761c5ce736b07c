mod cache;
mod common;
mod symbolize;
