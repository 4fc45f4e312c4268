use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseTransaction, EntityTrait, FromQueryResult,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{OrderList, OrderWithItems, PlaceOrderRequest, ShippingAddress, UpdateOrderStatusRequest},
    entity::{
        cart_items::{self, Column as CartCol, Entity as CartItems},
        order_items::{ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems, Model as OrderItemModel},
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{Order, OrderItem, OrderStatus},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

const ORDER_NO_ATTEMPTS: usize = 5;

/// Converts the caller's cart into a durable order: validates stock, writes
/// the order and its line-item snapshots, decrements inventory and clears the
/// cart, all inside one transaction. Any early return rolls the whole thing
/// back.
pub async fn place_order(
    state: &AppState,
    user: &AuthUser,
    payload: PlaceOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    validate_shipping_address(&payload.shipping_address)?;
    let ShippingAddress {
        name,
        phone,
        address,
        city,
        province,
        zip_code,
    } = payload.shipping_address;

    let txn = state.orm.begin().await?;

    #[derive(Debug, FromQueryResult)]
    struct CartProductRow {
        product_id: Uuid,
        quantity: i32,
        product_name: String,
        product_image: Option<String>,
        price: i64,
        stock: i32,
    }

    // Locks both the cart lines and the product rows for the rest of the
    // transaction, so competing checkouts serialize on the same stock.
    let rows = CartItems::find()
        .select_only()
        .column_as(CartCol::ProductId, "product_id")
        .column_as(CartCol::Quantity, "quantity")
        .column_as(ProdCol::Name, "product_name")
        .column_as(ProdCol::Image, "product_image")
        .column_as(ProdCol::Price, "price")
        .column_as(ProdCol::Stock, "stock")
        .join(JoinType::InnerJoin, cart_items::Relation::Products.def())
        .filter(CartCol::UserId.eq(user.user_id))
        .filter(ProdCol::IsActive.eq(true))
        .lock(LockType::Update)
        .into_model::<CartProductRow>()
        .all(&txn)
        .await?;

    if rows.is_empty() {
        return Err(AppError::EmptyCart);
    }

    let mut total_amount: i64 = 0;
    for row in &rows {
        if row.quantity <= 0 {
            return Err(AppError::BadRequest("Cart has invalid quantity".into()));
        }
        if row.stock < row.quantity {
            return Err(AppError::InsufficientStock {
                name: row.product_name.clone(),
                stock: row.stock,
            });
        }
        total_amount += row.price * (row.quantity as i64);
    }

    let order_no = allocate_order_no(&txn).await?;

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        order_no: Set(order_no),
        user_id: Set(user.user_id),
        total_amount: Set(total_amount),
        status: Set(OrderStatus::Pending.as_str().into()),
        shipping_name: Set(name),
        shipping_phone: Set(phone),
        shipping_address: Set(address),
        shipping_city: Set(city),
        shipping_province: Set(province),
        shipping_zip: Set(zip_code),
        remark: Set(payload.remark),
        paid_at: Set(None),
        shipped_at: Set(None),
        delivered_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut order_items: Vec<OrderItem> = Vec::new();

    for row in &rows {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(row.product_id),
            product_name: Set(row.product_name.clone()),
            product_image: Set(row.product_image.clone()),
            price: Set(row.price),
            quantity: Set(row.quantity),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;

        order_items.push(order_item_from_entity(item));

        // The guard re-checks sufficiency atomically with the decrement, so
        // a writer that slipped past the read above still cannot oversell.
        let updated = Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(row.quantity))
            .col_expr(
                ProdCol::SoldCount,
                Expr::col(ProdCol::SoldCount).add(row.quantity),
            )
            .filter(ProdCol::Id.eq(row.product_id))
            .filter(ProdCol::Stock.gte(row.quantity))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            return Err(AppError::InsufficientStock {
                name: row.product_name.clone(),
                stock: row.stock,
            });
        }
    }

    CartItems::delete_many()
        .filter(CartCol::UserId.eq(user.user_id))
        .exec(&txn)
        .await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_place",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "order_no": order.order_no })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order created",
        OrderWithItems {
            order: order_from_entity(order),
            items: order_items,
        },
        Some(Meta::empty()),
    ))
}

/// Cancels an owned order in `pending`/`paid` and puts the units back on the
/// shelf. Restock and the status flip commit together or not at all.
/// sold_count is deliberately left alone; it counts units ever sold.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let status = parse_status(&order.status)?;
    if !status.cancellable() {
        return Err(AppError::InvalidTransition {
            from: order.status.clone(),
            to: OrderStatus::Cancelled.as_str().into(),
        });
    }

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?;

    for item in &items {
        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).add(item.quantity))
            .filter(ProdCol::Id.eq(item.product_id))
            .exec(&txn)
            .await?;
    }

    let order_id = order.id;
    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled.as_str().into());
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_cancel",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order cancelled",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Administrative status transition along the fixed path. Stamps the
/// timestamp belonging to the target status; never touches stock (restock is
/// the cancel path's job).
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let next = OrderStatus::parse(&payload.status).ok_or(AppError::InvalidStatus)?;

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id).lock(LockType::Update).one(&txn).await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let current = parse_status(&order.status)?;
    if !current.can_transition_to(next) {
        return Err(AppError::InvalidTransition {
            from: order.status.clone(),
            to: next.as_str().into(),
        });
    }

    let mut active: OrderActive = order.into();
    active.status = Set(next.as_str().into());
    match next {
        OrderStatus::Paid => active.paid_at = Set(Some(Utc::now().into())),
        OrderStatus::Shipped => active.shipped_at = Set(Some(Utc::now().into())),
        OrderStatus::Delivered => active.delivered_at = Set(Some(Utc::now().into())),
        _ => {}
    }
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": order.status })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order status updated",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let items = attach_items(&state.orm, orders).await?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Ok", OrderList { items }, Some(meta)))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => o,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Pairs a page of orders with their line items in one extra query.
pub(crate) async fn attach_items<C: sea_orm::ConnectionTrait>(
    conn: &C,
    orders: Vec<OrderModel>,
) -> AppResult<Vec<OrderWithItems>> {
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
    for item in OrderItems::find()
        .filter(OrderItemCol::OrderId.is_in(ids))
        .all(conn)
        .await?
    {
        by_order
            .entry(item.order_id)
            .or_default()
            .push(order_item_from_entity(item));
    }

    Ok(orders
        .into_iter()
        .map(|order| {
            let items = by_order.remove(&order.id).unwrap_or_default();
            OrderWithItems {
                order: order_from_entity(order),
                items,
            }
        })
        .collect())
}

fn validate_shipping_address(addr: &ShippingAddress) -> AppResult<()> {
    let required = [
        ("name", &addr.name),
        ("phone", &addr.phone),
        ("address", &addr.address),
        ("city", &addr.city),
        ("province", &addr.province),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(AppError::BadRequest(format!(
                "shipping_address.{field} is required"
            )));
        }
    }
    Ok(())
}

/// Picks an order number that is free at this point of the transaction.
/// Bounded probing instead of insert-and-catch: a unique violation would
/// poison the open transaction, while the unique index still backstops the
/// unlikely probe/insert race at commit.
async fn allocate_order_no(txn: &DatabaseTransaction) -> AppResult<String> {
    for _ in 0..ORDER_NO_ATTEMPTS {
        let candidate = generate_order_no();
        let taken = Orders::find()
            .filter(OrderCol::OrderNo.eq(candidate.clone()))
            .count(txn)
            .await?;
        if taken == 0 {
            return Ok(candidate);
        }
    }
    Err(AppError::OrderNumberExhausted)
}

fn generate_order_no() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("ORD{date}{suffix:06}")
}

fn parse_status(raw: &str) -> AppResult<OrderStatus> {
    OrderStatus::parse(raw)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown order status in storage: {raw}")))
}

pub(crate) fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        order_no: model.order_no,
        user_id: model.user_id,
        total_amount: model.total_amount,
        status: model.status,
        shipping_name: model.shipping_name,
        shipping_phone: model.shipping_phone,
        shipping_address: model.shipping_address,
        shipping_city: model.shipping_city,
        shipping_province: model.shipping_province,
        shipping_zip: model.shipping_zip,
        remark: model.remark,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        shipped_at: model.shipped_at.map(|dt| dt.with_timezone(&Utc)),
        delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    }
}

pub(crate) fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        product_name: model.product_name,
        product_image: model.product_image,
        price: model.price,
        quantity: model.quantity,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::generate_order_no;

    #[test]
    fn order_no_shape() {
        let no = generate_order_no();
        assert_eq!(no.len(), "ORD".len() + 8 + 6);
        assert!(no.starts_with("ORD"));
        assert!(no[3..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn order_no_date_component_matches_today() {
        let no = generate_order_no();
        let today = chrono::Utc::now().format("%Y%m%d").to_string();
        assert_eq!(&no[3..11], today.as_str());
    }
}
