//! Macros for implementing services.
//!
//! - `persistent_service!`: implement [`Service`](crate::Service) for a serde
//!   type whose whole state is persisted at checkpoints

/// Implement [`Service`](crate::Service) for a `Serialize + DeserializeOwned`
/// type, persisting its full state in checkpoints.
///
/// An optional `release = method` names an inherent `fn(&mut self)` to run
/// as the release hook.
///
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default, Serialize, Deserialize)]
/// struct RowCounter {
///     rows: u64,
/// }
///
/// catena::persistent_service!(RowCounter, "row_counter");
/// ```
#[macro_export]
macro_rules! persistent_service {
    (@impl $ty:ty, $name:expr, { $($release:tt)* }) => {
        impl $crate::Service for $ty {
            const NAME: &'static str = $name;

            $($release)*

            fn snapshot(
                &self,
            ) -> ::std::result::Result<::std::option::Option<$crate::serde_json::Value>, $crate::ServiceError>
            {
                $crate::service::snapshot_json(self).map(::std::option::Option::Some)
            }

            fn hydrate(
                state: $crate::serde_json::Value,
            ) -> ::std::result::Result<Self, $crate::ServiceError> {
                $crate::service::hydrate_json(state)
            }
        }
    };

    ($ty:ty, $name:expr) => {
        $crate::persistent_service!(@impl $ty, $name, {});
    };

    ($ty:ty, $name:expr, release = $release:ident) => {
        $crate::persistent_service!(@impl $ty, $name, {
            fn release(&mut self) {
                <$ty>::$release(self)
            }
        });
    };
}
