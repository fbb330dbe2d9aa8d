mod appdata;
mod calendar;
mod client;
mod credentials;
mod tasks;

pub use appdata::{Blob, BlobStore};
pub use calendar::{
    CalendarEvent, CalendarService, EventBody, EventDateTime, EventPage, EventQuery,
};
pub use client::{ApiErrorClass, GoogleClient, GoogleError};
pub use credentials::{CredentialError, CredentialProvider, StaticCredentials};
pub use reqwest::StatusCode;
pub use tasks::{
    RemoteTask, RemoteTaskPage, TaskBody, TaskList, TaskListPage, TaskQuery, TasksService,
};
