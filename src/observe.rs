use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::listener::Listener;
use crate::registry::Registry;

/// Wrap `component` so that it re-renders whenever state it read changes.
///
/// Uses this thread's default registry. See [`Observed`].
pub fn observe<A, R, F>(component: F) -> Observed<A, R>
where
    A: 'static,
    R: Clone + 'static,
    F: FnMut(&A) -> R + 'static,
{
    observe_in(&Registry::current(), component)
}

/// [`observe`] in an explicit registry.
pub fn observe_in<A, R, F>(registry: &Registry, component: F) -> Observed<A, R>
where
    A: 'static,
    R: Clone + 'static,
    F: FnMut(&A) -> R + 'static,
{
    Observed::new(registry, component)
}

/// A render function bound to the state it reads.
///
/// Calling it with arguments renders immediately and remembers the
/// arguments. Afterwards, every write to a property read by the last render
/// re-renders with the most recent arguments and stores the output, which
/// [`latest`](Self::latest) returns.
///
/// ```ignore
/// let apples = State::new([("apples", 1)]);
/// let view = apples.get_state();
/// let label = observe(move |color: &String| {
///     format!("Apples: {}, color: {color}", view.get("apples").unwrap_or(0))
/// });
///
/// assert_eq!(label.call("blue".into()), "Apples: 1, color: blue");
/// apples.set_state([("apples", 2)])?;
/// assert_eq!(label.latest().as_deref(), Some("Apples: 2, color: blue"));
/// ```
pub struct Observed<A, R> {
    inner: Rc<ObservedInner<A, R>>,
}

struct ObservedInner<A, R> {
    registry: Registry,
    component: RefCell<Box<dyn FnMut(&A) -> R>>,
    args: RefCell<Option<Rc<A>>>,
    output: RefCell<Option<R>>,
    renders: Cell<usize>,
    rerender: Listener,
}

impl<A: 'static, R: Clone + 'static> Observed<A, R> {
    fn new<F>(registry: &Registry, component: F) -> Self
    where
        F: FnMut(&A) -> R + 'static,
    {
        let inner = Rc::new_cyclic(|weak: &Weak<ObservedInner<A, R>>| {
            let weak = weak.clone();
            ObservedInner {
                registry: registry.clone(),
                component: RefCell::new(Box::new(component)),
                args: RefCell::new(None),
                output: RefCell::new(None),
                renders: Cell::new(0),
                rerender: Listener::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.rerender();
                    }
                }),
            }
        });
        Self { inner }
    }

    /// Render with `args` and return the output.
    pub fn call(&self, args: A) -> R {
        let args = Rc::new(args);
        *self.inner.args.borrow_mut() = Some(args.clone());
        self.inner.render(&args)
    }
}

impl<A, R: Clone> Observed<A, R> {
    /// Output of the most recent render, if any.
    pub fn latest(&self) -> Option<R> {
        self.inner.output.borrow().clone()
    }
}

impl<A, R> Observed<A, R> {
    /// How many times the component has run.
    pub fn render_count(&self) -> usize {
        self.inner.renders.get()
    }

    /// The listener renders are tracked under.
    ///
    /// Pass it to [`State::unsubscribe`](crate::State::unsubscribe) to stop
    /// re-rendering on that state's changes.
    pub fn listener(&self) -> &Listener {
        &self.inner.rerender
    }
}

impl<A, R: Clone> ObservedInner<A, R> {
    fn render(&self, args: &A) -> R {
        let output = self.registry.track(&self.rerender, || {
            let mut component = self.component.borrow_mut();
            (*component)(args)
        });
        self.renders.set(self.renders.get() + 1);
        *self.output.borrow_mut() = Some(output.clone());
        output
    }

    fn rerender(&self) {
        let args = self.args.borrow().clone();
        match args {
            Some(args) => {
                tracing::trace!(renders = self.renders.get(), "re-rendering observed component");
                self.render(&args);
            }
            None => {
                cov_mark::hit!(rerender_before_first_call);
            }
        }
    }
}

impl<A, R> Clone for Observed<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, R: fmt::Debug> fmt::Debug for Observed<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observed")
            .field("renders", &self.inner.renders.get())
            .field("latest", &*self.inner.output.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    struct Props {
        color: &'static str,
    }

    #[test]
    fn renders_with_latest_args_on_change() {
        let registry = Registry::new();
        let apples = State::new_in(&registry, [("apples", 1)]);
        let view = apples.get_state();
        let label = observe_in(&registry, move |props: &Props| {
            format!("Apples: {}, color: {}", view.get("apples").unwrap_or(0), props.color)
        });

        assert_eq!(label.call(Props { color: "blue" }), "Apples: 1, color: blue");
        assert_eq!(label.render_count(), 1);

        apples.set_state([("apples", 2)]).unwrap();
        assert_eq!(label.latest().as_deref(), Some("Apples: 2, color: blue"));
        apples.set_state([("apples", 18)]).unwrap();
        assert_eq!(label.latest().as_deref(), Some("Apples: 18, color: blue"));
        assert_eq!(label.render_count(), 3);

        assert_eq!(label.call(Props { color: "red" }), "Apples: 18, color: red");
        assert_eq!(label.render_count(), 4);
    }

    #[test]
    fn reads_across_states_rerender_once_per_batch() {
        let registry = Registry::new();
        let apples = State::new_in(&registry, [("apples", 1)]);
        let bananas = State::new_in(&registry, [("bananas", 1)]);
        let (apples_view, bananas_view) = (apples.get_state(), bananas.get_state());
        let label = observe_in(&registry, move |_: &()| {
            format!(
                "Apples: {}, bananas: {}",
                apples_view.get("apples").unwrap_or(0),
                bananas_view.get("bananas").unwrap_or(0)
            )
        });
        label.call(());

        apples.set_state([("apples", 10)]).unwrap();
        bananas.set_state([("bananas", 10)]).unwrap();
        assert_eq!(label.render_count(), 3);

        registry
            .batch(|| {
                apples.set_state([("apples", 2)])?;
                bananas.set_state([("bananas", 2)])?;
                apples.set_state([("apples", 5)])?;
                bananas.set_state([("bananas", 5)])
            })
            .unwrap();

        assert_eq!(label.render_count(), 4);
        assert_eq!(label.latest().as_deref(), Some("Apples: 5, bananas: 5"));
    }

    #[test]
    fn unsubscribed_component_stops_rerendering() {
        let registry = Registry::new();
        let apples = State::new_in(&registry, [("apples", 1)]);
        let view = apples.get_state();
        let count = observe_in(&registry, move |_: &()| view.get("apples").unwrap_or(0));
        count.call(());

        assert!(apples.unsubscribe(count.listener()));
        apples.set_state([("apples", 7)]).unwrap();

        assert_eq!(count.render_count(), 1);
        assert_eq!(count.latest(), Some(1));
    }

    #[test]
    fn stray_notification_before_first_call_is_ignored() {
        cov_mark::check!(rerender_before_first_call);

        let registry = Registry::new();
        let count = observe_in(&registry, |_: &()| 0);
        registry.execute(count.listener());

        assert_eq!(count.render_count(), 0);
        assert_eq!(count.latest(), None);
    }
}
