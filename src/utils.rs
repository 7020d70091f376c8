use std::any::Any;

/// Splits `items` into `parts` contiguous chunks.
///
/// The first `len % parts` chunks receive one extra item, so chunk sizes
/// differ by at most one and the larger chunks come first.
pub fn split_chunks<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    debug_assert!(parts > 0);
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut items = items.into_iter();
    (0..parts)
        .map(|index| {
            let len = if index < extra { base + 1 } else { base };
            items.by_ref().take(len).collect()
        })
        .collect()
}

/// Renders a panic payload as text.
///
/// `panic!` produces either a `&'static str` or a `String`; anything else was
/// raised through `std::panic::panic_any` and has no textual form.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
