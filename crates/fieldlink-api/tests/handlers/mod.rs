mod basic;
mod commands;
mod sensors;
