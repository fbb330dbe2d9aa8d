mod fakes;
mod hooks;
mod pull_calendar;
mod pull_tasks;
mod push;
