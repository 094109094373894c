//! Server-sent log streams: the backlog first, then live lines until the
//! client goes away.

use std::convert::Infallible;

use futures::{Stream, StreamExt, stream};
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use crate::ledger::Subscription;
use crate::routes::agents::NameQuery;
use crate::routes::tasks::IdQuery;
use crate::routes::{AppState, with_state};

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let tasks = warp::path!("events" / "tasks")
    .and(warp::get())
    .and(warp::query::<IdQuery>())
    .and(with_state(state.clone()))
    .and_then(|query: IdQuery, state: AppState| async move {
      let id = query.required()?;
      Ok::<_, Rejection>(reply(state.registry.subscribe_task(&id)))
    });

  let agents = warp::path!("events" / "agents")
    .and(warp::get())
    .and(warp::query::<NameQuery>())
    .and(with_state(state))
    .and_then(|query: NameQuery, state: AppState| async move {
      let name = query.required()?;
      Ok::<_, Rejection>(reply(state.registry.subscribe_agent(&name)))
    });

  tasks.or(agents)
}

/// The subscription is registered before the backlog is taken, so no line
/// can fall between the two. Dropping the stream unsubscribes.
pub fn events(mut subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
  let backlog = stream::iter(subscription.take_backlog());
  backlog
    .chain(subscription)
    .map(|line| Ok(Event::default().data(line.to_string())))
}

fn reply(subscription: Subscription) -> impl Reply {
  warp::sse::reply(warp::sse::keep_alive().stream(events(subscription)))
}
