//! In-process fetcher with canned answers per URL.

use std::collections::HashMap;
use std::sync::Mutex;

use super::error::FetchError;
use super::types::{Request, Response};
use super::Fetcher;

#[derive(Clone)]
enum Answer {
  Respond { status: u16, body: Vec<u8> },
  Fail,
}

/// Fetcher that answers from a script and records every call.
///
/// URLs with no script entry fail like an unreachable host.
#[derive(Default)]
pub struct ScriptedFetcher {
  answers: Mutex<HashMap<String, Answer>>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.answers.lock().unwrap().insert(
      url.to_string(),
      Answer::Respond {
        status,
        body: body.as_bytes().to_vec(),
      },
    );
  }

  pub fn fail(&self, url: &str) {
    self
      .answers
      .lock()
      .unwrap()
      .insert(url.to_string(), Answer::Fail);
  }

  /// Simulate going offline for every URL.
  pub fn go_offline(&self) {
    let mut answers = self.answers.lock().unwrap();
    for answer in answers.values_mut() {
      *answer = Answer::Fail;
    }
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|u| u.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    // Fragments never go over the wire
    let url = request.cache_key();
    self.calls.lock().unwrap().push(url.clone());

    let answer = self.answers.lock().unwrap().get(&url).cloned();
    match answer {
      Some(Answer::Respond { status, body }) => Ok(Response::new(url, status, body)),
      Some(Answer::Fail) | None => Err(FetchError::Network(format!("unreachable: {}", url))),
    }
  }
}
