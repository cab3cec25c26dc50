use std::collections::BTreeMap;

use crate::object::{Attributes, CanvasObject};
use crate::types::*;

pub trait ObjectReadable {
    fn get_object(&self, object_id: &ObjectId) -> Option<&CanvasObject>;
    fn is_tombstoned(&self, object_id: &ObjectId) -> bool;

    /// Live objects in id order.
    fn live_objects(&self) -> Box<dyn Iterator<Item = &CanvasObject> + '_>;

    fn get_attributes(&self, object_id: &ObjectId) -> Option<&Attributes> {
        self.get_object(object_id).map(|object| &object.attributes)
    }

    fn is_live(&self, object_id: &ObjectId) -> bool {
        self.get_object(object_id).is_some()
    }

    /// What a renderer would draw. Used to compare replicas.
    fn live_set(&self) -> BTreeMap<ObjectId, Attributes> {
        self.live_objects()
            .map(|object| (object.id, object.attributes.clone()))
            .collect()
    }
}
