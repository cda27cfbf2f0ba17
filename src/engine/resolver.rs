use std::sync::Arc;

use ulid::Ulid;

use crate::limits::MAX_SERVICE_DURATION_MINUTES;
use crate::model::*;
use crate::ports::{CustomerLookup, ServiceLookup, ShopLookup, StaffLookup};

use super::error::{BookingError, EntityKind};

/// Records a booking request refers to, all scoped to one shop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntities {
    pub shop: Shop,
    pub service: Service,
    pub customer: Customer,
    pub staff: Option<Staff>,
}

pub struct EntityResolver {
    shops: Arc<dyn ShopLookup>,
    services: Arc<dyn ServiceLookup>,
    customers: Arc<dyn CustomerLookup>,
    staff: Arc<dyn StaffLookup>,
}

impl EntityResolver {
    pub fn new(
        shops: Arc<dyn ShopLookup>,
        services: Arc<dyn ServiceLookup>,
        customers: Arc<dyn CustomerLookup>,
        staff: Arc<dyn StaffLookup>,
    ) -> Self {
        Self {
            shops,
            services,
            customers,
            staff,
        }
    }

    /// Load every referenced record and check they all belong to `shop_id`.
    ///
    /// The lookups are independent and are issued together; missing records
    /// are reported in shop, service, customer, staff order.
    pub async fn resolve(
        &self,
        shop_id: Ulid,
        service_id: Ulid,
        customer_id: Ulid,
        staff_id: Option<Ulid>,
    ) -> Result<ResolvedEntities, BookingError> {
        let staff_lookup = async {
            match staff_id {
                Some(id) => self.staff.get_staff(id).await,
                None => Ok(None),
            }
        };
        let (shop, service, customer, staff) = futures::try_join!(
            self.shops.get_shop(shop_id),
            self.services.get_service(service_id),
            self.customers.get_customer(customer_id),
            staff_lookup,
        )?;

        let shop = shop.ok_or(BookingError::not_found(EntityKind::Shop, shop_id))?;
        let service = service.ok_or(BookingError::not_found(EntityKind::Service, service_id))?;
        let customer = customer.ok_or(BookingError::not_found(EntityKind::Customer, customer_id))?;
        let staff = match staff_id {
            Some(id) => Some(staff.ok_or(BookingError::not_found(EntityKind::Staff, id))?),
            None => None,
        };

        if service.shop_id != shop.id {
            return Err(BookingError::bad_request("service does not belong to shop"));
        }
        if customer.shop_id != shop.id {
            return Err(BookingError::bad_request("customer does not belong to shop"));
        }
        if let Some(ref s) = staff {
            if s.shop_id != shop.id {
                return Err(BookingError::bad_request("staff does not belong to shop"));
            }
            if !s.active {
                return Err(BookingError::bad_request("staff member is inactive"));
            }
        }
        if service.duration_minutes <= 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(BookingError::bad_request(format!(
                "service duration out of range: {} minutes",
                service.duration_minutes
            )));
        }

        Ok(ResolvedEntities {
            shop,
            service,
            customer,
            staff,
        })
    }
}
